//! Post-pipeline verifier
//!
//! Runs after every step exited zero and decides whether the deployment is
//! actually serving. Each check is independent; one failing never skips the
//! others, so the report always names everything that is wrong.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::journal::Journal;
use crate::models::deployment::{DeploymentMode, ServerDescriptor, VerificationFlags};
use crate::remote::session::RemoteSession;
use crate::remote::stream::{NullSink, OutputSink};
use crate::storage::settings::{EndpointCheck, VerificationSettings};
use crate::verify::probe::{
    endpoint_command, external_probe, is_reachable_status, loopback_command, parse_status_output,
    service_check_command,
};

/// Step name used when verification fails
pub const VERIFICATION_STEP: &str = "final_verification";

/// Outcome of the three checks
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub services_healthy: bool,
    pub domain_accessible: bool,
    pub endpoints_ok: bool,

    /// One line per failed check
    pub failures: Vec<String>,
}

impl VerificationReport {
    pub fn passed(&self) -> bool {
        self.services_healthy && self.domain_accessible && self.endpoints_ok
    }

    pub fn flags(&self) -> VerificationFlags {
        let mut flags = VerificationFlags::default();
        flags.record(self.services_healthy, self.domain_accessible, self.endpoints_ok);
        flags
    }
}

/// Checks services, domain reachability and application endpoints
#[derive(Debug, Clone)]
pub struct Verifier {
    settings: VerificationSettings,
}

impl Verifier {
    pub fn new(settings: VerificationSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &VerificationSettings {
        &self.settings
    }

    pub async fn verify(
        &self,
        session: &dyn RemoteSession,
        server: &ServerDescriptor,
        mode: DeploymentMode,
        journal: &Journal,
    ) -> VerificationReport {
        let step = Some(VERIFICATION_STEP);
        journal.info(step, "Verifying deployment").await;

        let mut report = VerificationReport::default();

        report.services_healthy = self.check_services(session, mode, journal, &mut report.failures).await;
        report.domain_accessible = self.check_domain(session, &server.domain, journal, &mut report.failures).await;
        report.endpoints_ok = self.check_endpoints(session, &server.domain, journal, &mut report.failures).await;

        if report.passed() {
            journal.info(step, "All verification checks passed").await;
        } else {
            journal
                .error(step, format!("Verification failed: {}", report.failures.join("; ")))
                .await;
        }
        report
    }

    async fn check_services(
        &self,
        session: &dyn RemoteSession,
        mode: DeploymentMode,
        journal: &Journal,
        failures: &mut Vec<String>,
    ) -> bool {
        let mut healthy = true;
        for service in &self.settings.services {
            let command = service_check_command(service, mode);
            let active = match session.execute(&command, self.settings.check_timeout(), null_sink()).await {
                Ok(output) => output.success(),
                Err(e) => {
                    journal
                        .warn(Some(VERIFICATION_STEP), format!("Service check for {} failed to run: {}", service, e))
                        .await;
                    false
                }
            };

            if active {
                journal.debug(Some(VERIFICATION_STEP), format!("{} is active", service)).await;
            } else {
                failures.push(format!("service {} is not active", service));
                healthy = false;
            }
        }
        healthy
    }

    async fn check_domain(
        &self,
        session: &dyn RemoteSession,
        domain: &str,
        journal: &Journal,
        failures: &mut Vec<String>,
    ) -> bool {
        let scheme = &self.settings.scheme;
        let timeout = self.settings.check_timeout();

        let command = loopback_command(scheme, domain, timeout);
        let loopback = match session.execute(&command, timeout, null_sink()).await {
            Ok(output) => parse_status_output(&output.stdout).map(|(_, status)| status),
            Err(e) => {
                journal
                    .warn(Some(VERIFICATION_STEP), format!("Loopback check failed to run: {}", e))
                    .await;
                None
            }
        };

        let mut accessible = match loopback {
            Some(status) if is_reachable_status(status) => true,
            Some(status) => {
                failures.push(format!("{} answered {} on loopback", domain, status));
                false
            }
            None => {
                failures.push(format!("{} did not answer on loopback", domain));
                false
            }
        };

        if self.settings.external_check {
            match external_probe(scheme, domain, timeout).await {
                Ok(status) if is_reachable_status(status) => {
                    journal
                        .debug(Some(VERIFICATION_STEP), format!("{} reachable externally ({})", domain, status))
                        .await;
                }
                Ok(status) => {
                    failures.push(format!("{} answered {} externally", domain, status));
                    accessible = false;
                }
                Err(e) => {
                    failures.push(format!("{} not reachable externally: {}", domain, e));
                    accessible = false;
                }
            }
        }

        accessible
    }

    async fn check_endpoints(
        &self,
        session: &dyn RemoteSession,
        domain: &str,
        journal: &Journal,
        failures: &mut Vec<String>,
    ) -> bool {
        let mut ok = true;
        for endpoint in &self.settings.endpoints {
            if let Err(reason) = self.check_endpoint(session, domain, endpoint).await {
                journal
                    .warn(Some(VERIFICATION_STEP), format!("Endpoint {}: {}", endpoint.path, reason))
                    .await;
                failures.push(format!("endpoint {} {}", endpoint.path, reason));
                ok = false;
            }
        }
        ok
    }

    async fn check_endpoint(
        &self,
        session: &dyn RemoteSession,
        domain: &str,
        endpoint: &EndpointCheck,
    ) -> Result<(), String> {
        let timeout = self.settings.check_timeout();
        let command = endpoint_command(&self.settings.scheme, domain, &endpoint.path, timeout);

        let output = session
            .execute(&command, timeout, null_sink())
            .await
            .map_err(|e| format!("failed to run: {}", e))?;
        let (body, status) =
            parse_status_output(&output.stdout).ok_or_else(|| "returned no status".to_string())?;

        if status != endpoint.expected_status {
            return Err(format!("returned {} (expected {})", status, endpoint.expected_status));
        }
        if let Some(needle) = &endpoint.contains {
            if !body.contains(needle.as_str()) {
                return Err(format!("body does not contain {:?}", needle));
            }
        }
        Ok(())
    }
}

fn null_sink() -> Arc<dyn OutputSink> {
    Arc::new(NullSink)
}
