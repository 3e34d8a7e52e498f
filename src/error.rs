use thiserror::Error;

#[derive(Error, Debug)]
pub enum EdgekitError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Cloud storage error in container {container}: {message}")]
    Cloud { container: String, message: String },

    #[error("Component error in {component}: {message}")]
    Component { component: String, message: String },

    #[error("Sensor error in {sensor}: {message}")]
    Sensor { sensor: String, message: String },
}

impl EdgekitError {
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    pub fn cloud<S: Into<String>>(container: S, message: S) -> Self {
        Self::Cloud {
            container: container.into(),
            message: message.into(),
        }
    }

    pub fn component<S: Into<String>>(component: S, message: S) -> Self {
        Self::Component {
            component: component.into(),
            message: message.into(),
        }
    }

    pub fn sensor<S: Into<String>>(sensor: S, message: S) -> Self {
        Self::Sensor {
            sensor: sensor.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EdgekitError>;
