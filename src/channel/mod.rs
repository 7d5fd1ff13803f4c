//! Method channel surface
//!
//! The application shell calls in with a method name and an argument map and
//! gets back a success value, a structured error, or "not implemented".
//! Only caller mistakes become structured errors; every other failure is
//! logged and answered with `null`.

mod handler;

pub use handler::BiometricChannel;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Default channel name
pub const DEFAULT_CHANNEL_NAME: &str = "com.your.app/biometric_crypto";

pub const METHOD_ENCRYPT: &str = "encryptWithBiometric";
pub const METHOD_DECRYPT: &str = "decryptWithBiometric";
pub const METHOD_REMOVE_KEY: &str = "removeFromKeystore";
pub const METHOD_STORE_SECRET: &str = "storeInKeychain";
pub const METHOD_RETRIEVE_SECRET: &str = "retrieveFromKeychain";
pub const METHOD_REMOVE_SECRET: &str = "removeFromKeychain";

/// Error code for missing keystore arguments
pub const CODE_INVALID_ARGUMENT: &str = "INVALID_ARGUMENT";

/// Error code for missing keychain arguments
pub const CODE_INVALID_ARGUMENTS: &str = "INVALID_ARGUMENTS";

/// One incoming call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodCall {
    pub method: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl MethodCall {
    pub fn new(method: impl Into<String>) -> Self {
        MethodCall {
            method: method.into(),
            arguments: Map::new(),
        }
    }

    pub fn arg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.insert(name.into(), value.into());
        self
    }

    /// String argument; `null`, missing and non-string values are all absent
    pub fn str_arg(&self, name: &str) -> Option<&str> {
        self.arguments.get(name).and_then(Value::as_str)
    }
}

/// Answer to one call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum MethodResponse {
    Success {
        result: Value,
    },
    Error {
        code: String,
        message: String,
        #[serde(default)]
        details: Option<Value>,
    },
    NotImplemented,
}

impl MethodResponse {
    pub fn success(result: impl Into<Value>) -> Self {
        MethodResponse::Success {
            result: result.into(),
        }
    }

    /// Success with no value; how denials and failures are reported
    pub fn null() -> Self {
        MethodResponse::Success {
            result: Value::Null,
        }
    }

    pub fn error(code: &str, message: &str) -> Self {
        MethodResponse::Error {
            code: code.to_string(),
            message: message.to_string(),
            details: None,
        }
    }

    /// The success value, if any
    pub fn result(&self) -> Option<&Value> {
        match self {
            MethodResponse::Success { result } => Some(result),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, MethodResponse::Success { result: Value::Null })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_from_json() {
        let call: MethodCall = serde_json::from_value(json!({
            "method": "encryptWithBiometric",
            "arguments": { "data": "secret", "promptTitle": null }
        }))
        .unwrap();

        assert_eq!(call.method, METHOD_ENCRYPT);
        assert_eq!(call.str_arg("data"), Some("secret"));
        assert_eq!(call.str_arg("promptTitle"), None);
        assert_eq!(call.str_arg("promptSubtitle"), None);
    }

    #[test]
    fn test_call_without_arguments() {
        let call: MethodCall =
            serde_json::from_value(json!({ "method": "removeFromKeystore" })).unwrap();
        assert!(call.arguments.is_empty());
    }

    #[test]
    fn test_non_string_argument_is_absent() {
        let call = MethodCall::new(METHOD_ENCRYPT).arg("data", 42);
        assert_eq!(call.str_arg("data"), None);
    }

    #[test]
    fn test_response_json_shape() {
        let error = serde_json::to_value(MethodResponse::error(
            CODE_INVALID_ARGUMENT,
            "Data cannot be null",
        ))
        .unwrap();
        assert_eq!(
            error,
            json!({
                "status": "error",
                "code": "INVALID_ARGUMENT",
                "message": "Data cannot be null",
                "details": null
            })
        );

        let null = serde_json::to_value(MethodResponse::null()).unwrap();
        assert_eq!(null, json!({ "status": "success", "result": null }));

        let ni = serde_json::to_value(MethodResponse::NotImplemented).unwrap();
        assert_eq!(ni, json!({ "status": "notImplemented" }));
    }
}
