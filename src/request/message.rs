use std::fs;
use std::path::{Path, PathBuf};

use jsonschema::JSONSchema;
use log::{info, warn};
use serde_json::Value;
use thiserror::Error as ThisError;

use crate::job::descriptor::JobDescriptor;

/// included job descriptor schema
static SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/data/schema/job_descriptor.json"
));

#[derive(Debug, ThisError)]
pub enum MessageError {
    #[error("can't read job descriptor at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("job descriptor {path} is not valid JSON: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("job descriptor {path} fails validation:\n{}", .errors.join("\n"))]
    Validation { path: PathBuf, errors: Vec<String> },

    #[error("job descriptor {path} can't be deserialised: {source}")]
    Deserialisation {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("bundled job descriptor schema is invalid: {0}")]
    Schema(String),
}

/// Compile the bundled job descriptor schema
pub fn load_schema() -> Result<JSONSchema, MessageError> {
    let schema: Value =
        serde_json::from_str(SCHEMA).map_err(|err| MessageError::Schema(err.to_string()))?;
    JSONSchema::compile(&schema).map_err(|err| MessageError::Schema(err.to_string()))
}

/// A job descriptor file
pub struct Message {
    pub path: PathBuf,
    pub compiled_schema: JSONSchema,
}

impl Message {
    pub fn new(path: &Path) -> Result<Message, MessageError> {
        Ok(Message {
            path: path.to_path_buf(),
            compiled_schema: load_schema()?,
        })
    }

    pub fn read(&self) -> Result<JobDescriptor, MessageError> {
        let json = self.parse_untyped_json()?;
        match self.validate(&json) {
            Ok(_) => {
                info!("Job descriptor is valid");
                self.parse_json(json)
            }
            Err(err) => {
                warn!("Job descriptor fails validation");
                Err(err)
            }
        }
    }

    fn validate(&self, json: &Value) -> Result<(), MessageError> {
        info!("Validating {} against JSON schema", self.path.display());
        self.compiled_schema.validate(json).map_err(|errors| {
            let errors: Vec<String> = errors
                .map(|err| format!("{}: {}", err.instance_path, err))
                .collect();
            MessageError::Validation {
                path: self.path.clone(),
                errors,
            }
        })
    }

    fn parse_untyped_json(&self) -> Result<Value, MessageError> {
        info!("Reading job descriptor at {}", self.path.display());
        let json_string = fs::read_to_string(&self.path).map_err(|source| MessageError::Read {
            path: self.path.clone(),
            source,
        })?;
        serde_json::from_str::<Value>(&json_string).map_err(|source| MessageError::Decode {
            path: self.path.clone(),
            source,
        })
    }

    fn parse_json(&self, value: Value) -> Result<JobDescriptor, MessageError> {
        serde_json::from_value::<JobDescriptor>(value).map_err(|source| {
            MessageError::Deserialisation {
                path: self.path.clone(),
                source,
            }
        })
    }
}
