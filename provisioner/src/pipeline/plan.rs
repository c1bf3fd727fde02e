//! Ordered provisioning steps

use crate::models::deployment::{DeploymentMode, ServerDescriptor};
use crate::models::step::{FileUpload, PipelineStep, StepDescriptor};
use crate::storage::settings::AppSettings;

/// An ordered, immutable list of steps
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pipeline {
    steps: Vec<PipelineStep>,
}

impl Pipeline {
    pub fn new(steps: Vec<PipelineStep>) -> Self {
        Self { steps }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, index: usize) -> Option<&PipelineStep> {
        self.steps.get(index)
    }

    pub fn steps(&self) -> &[PipelineStep] {
        &self.steps
    }

    /// Index of the step with the given name
    pub fn position(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name() == name)
    }

    pub fn descriptors(&self) -> Vec<StepDescriptor> {
        self.steps.iter().map(|s| s.descriptor.clone()).collect()
    }
}

/// The standard provisioning pipeline for a host.
///
/// Containerized mode inserts `install_docker` and runs the backend through
/// compose; every other step name is shared by both modes.
pub fn standard_pipeline(server: &ServerDescriptor, mode: DeploymentMode, app: &AppSettings) -> Pipeline {
    let dir = &app.app_dir;
    let domain = &server.domain;
    let apt = "DEBIAN_FRONTEND=noninteractive apt-get";

    let mut steps = vec![
        PipelineStep::new(
            "update_system",
            "Refresh package indexes and apply upgrades",
            vec![
                format!("{} update -y", apt),
                format!("{} upgrade -y -o Dpkg::Options::=--force-confold", apt),
            ],
        ),
        PipelineStep::new(
            "install_packages",
            "Install system packages",
            vec![
                "curl -fsSL https://deb.nodesource.com/setup_18.x | bash -".to_string(),
                format!(
                    "{} install -y git curl build-essential nginx postgresql nodejs certbot python3-certbot-nginx psmisc",
                    apt
                ),
            ],
        ),
    ];

    if mode == DeploymentMode::Containerized {
        steps.push(PipelineStep::new(
            "install_docker",
            "Install Docker engine and compose plugin",
            vec![
                "command -v docker >/dev/null || curl -fsSL https://get.docker.com | sh".to_string(),
                "systemctl enable --now docker".to_string(),
                "docker compose version".to_string(),
            ],
        ));
    }

    steps.push(PipelineStep::new(
        "setup_database",
        "Create the application database and role",
        vec![
            "systemctl enable --now postgresql".to_string(),
            "sudo -u postgres psql -tc \"SELECT 1 FROM pg_roles WHERE rolname='app'\" | grep -q 1 || sudo -u postgres psql -c \"CREATE ROLE app LOGIN PASSWORD 'app'\"".to_string(),
            "sudo -u postgres psql -tc \"SELECT 1 FROM pg_database WHERE datname='app'\" | grep -q 1 || sudo -u postgres createdb -O app app".to_string(),
        ],
    ));

    steps.push(PipelineStep::new(
        "clone_repository",
        "Fetch the application source",
        vec![format!(
            "if [ -d {dir}/.git ]; then git -C {dir} fetch origin {branch} && git -C {dir} reset --hard origin/{branch}; else git clone -b {branch} {repo} {dir}; fi",
            dir = dir,
            branch = app.branch,
            repo = app.repository
        )],
    ));

    if let Some(env_file) = &app.env_file {
        steps.push(
            PipelineStep::new(
                "upload_env",
                "Upload the environment file",
                vec![format!("chmod 600 {}/.env", dir)],
            )
            .with_upload(FileUpload {
                local: env_file.clone(),
                remote: format!("{}/.env", dir),
            }),
        );
    }

    let backend = match mode {
        DeploymentMode::Standard => vec![
            format!("cd {} && npm ci --no-audit --no-fund", dir),
            format!("cd {} && npm run migrate --if-present", dir),
            format!(
                "cat > /etc/systemd/system/app-backend.service <<'UNIT'\n[Unit]\nDescription=Application backend\nAfter=network.target postgresql.service\n\n[Service]\nWorkingDirectory={dir}\nEnvironmentFile=-{dir}/.env\nEnvironment=PORT={port}\nExecStart=/usr/bin/npm run start\nRestart=on-failure\n\n[Install]\nWantedBy=multi-user.target\nUNIT",
                dir = dir,
                port = app.backend_port
            ),
            "systemctl daemon-reload".to_string(),
        ],
        DeploymentMode::Containerized => vec![
            format!("cd {} && docker compose pull --ignore-buildable", dir),
            format!("cd {} && docker compose up -d --build", dir),
        ],
    };
    steps.push(PipelineStep::new(
        "configure_backend",
        "Install dependencies, migrate and register the backend",
        backend,
    ));

    steps.push(PipelineStep::new(
        "build_frontend",
        "Build the frontend bundle",
        vec![format!(
            "cd {} && if [ -d frontend ]; then cd frontend && npm ci --no-audit --no-fund && npm run build; fi",
            dir
        )],
    ));

    steps.push(PipelineStep::new(
        "setup_nginx",
        "Configure nginx as reverse proxy",
        vec![
            format!(
                "cat > /etc/nginx/sites-available/{domain} <<'SITE'\nserver {{\n    listen 80;\n    server_name {domain};\n    root {dir}/frontend/dist;\n    location /api/ {{\n        proxy_pass http://127.0.0.1:{port};\n        proxy_set_header Host $host;\n        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;\n    }}\n    location / {{\n        try_files $uri /index.html;\n    }}\n}}\nSITE",
                domain = domain,
                dir = dir,
                port = app.backend_port
            ),
            format!(
                "ln -sf /etc/nginx/sites-available/{domain} /etc/nginx/sites-enabled/{domain}",
                domain = domain
            ),
            "nginx -t".to_string(),
            "systemctl enable nginx && systemctl reload-or-restart nginx".to_string(),
        ],
    ));

    let email = app
        .admin_email
        .clone()
        .unwrap_or_else(|| format!("admin@{}", domain));
    steps.push(PipelineStep::new(
        "setup_ssl",
        "Obtain a TLS certificate",
        vec![format!(
            "certbot --nginx -d {} --non-interactive --agree-tos -m {} --redirect --keep-until-expiring",
            domain, email
        )],
    ));

    let start = match mode {
        DeploymentMode::Standard => {
            "systemctl enable --now app-backend && systemctl restart app-backend".to_string()
        }
        DeploymentMode::Containerized => format!("cd {} && docker compose up -d --remove-orphans", dir),
    };
    steps.push(PipelineStep::new(
        "start_services",
        "Start application services",
        vec![start, "systemctl reload nginx".to_string()],
    ));

    Pipeline::new(steps)
}
