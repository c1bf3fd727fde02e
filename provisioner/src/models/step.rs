//! Step models

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Name and human description of one pipeline step.
///
/// The name is the step's identity across pipeline versions: persisted
/// deployments refer to steps by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepDescriptor {
    pub name: String,
    pub description: String,
}

impl StepDescriptor {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
        }
    }
}

/// A local file copied to the host before the step's commands run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileUpload {
    pub local: PathBuf,
    pub remote: String,
}

/// A step and the work it performs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineStep {
    pub descriptor: StepDescriptor,
    pub uploads: Vec<FileUpload>,
    pub commands: Vec<String>,
}

impl PipelineStep {
    pub fn new(name: &str, description: &str, commands: Vec<String>) -> Self {
        Self {
            descriptor: StepDescriptor::new(name, description),
            uploads: Vec::new(),
            commands,
        }
    }

    pub fn with_upload(mut self, upload: FileUpload) -> Self {
        self.uploads.push(upload);
        self
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }
}
