//! Definition of DeviceError used by the attach and detach code.
use std::string::FromUtf8Error;

use tonic::Status;

pub struct DeviceError {
    pub message: String,
}

impl DeviceError {
    pub fn new(message: &str) -> DeviceError {
        DeviceError {
            message: String::from(message),
        }
    }
}

impl std::fmt::Debug for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for DeviceError {}

impl From<std::io::Error> for DeviceError {
    fn from(error: std::io::Error) -> DeviceError {
        DeviceError {
            message: format!("{error}"),
        }
    }
}

impl From<String> for DeviceError {
    fn from(message: String) -> DeviceError {
        DeviceError { message }
    }
}

impl From<std::num::ParseIntError> for DeviceError {
    fn from(error: std::num::ParseIntError) -> DeviceError {
        DeviceError {
            message: format!("{error}"),
        }
    }
}

impl From<serde_json::error::Error> for DeviceError {
    fn from(error: serde_json::error::Error) -> DeviceError {
        DeviceError {
            message: format!("{error}"),
        }
    }
}

impl From<FromUtf8Error> for DeviceError {
    fn from(error: FromUtf8Error) -> DeviceError {
        DeviceError {
            message: format!("{error}"),
        }
    }
}

impl From<glob::PatternError> for DeviceError {
    fn from(error: glob::PatternError) -> DeviceError {
        DeviceError {
            message: format!("{error}"),
        }
    }
}

impl From<glob::GlobError> for DeviceError {
    fn from(error: glob::GlobError) -> DeviceError {
        DeviceError {
            message: format!("{error}"),
        }
    }
}

impl From<DeviceError> for Status {
    fn from(error: DeviceError) -> Status {
        Status::internal(error.message)
    }
}
