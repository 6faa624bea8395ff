//! Tool-server transport configuration (spec §6.4).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ToolClientError;
use crate::tool::masking::MaskingConfig;

const MIN_TIMEOUT_SECS: u64 = 1;
const MAX_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServerConfig {
    pub name: String,
    #[serde(flatten)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub masking: Option<MaskingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        timeout: u64,
    },
    Http {
        url: String,
        #[serde(default)]
        bearer_token: Option<String>,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default = "default_verify_ssl")]
        verify_ssl: bool,
        timeout: u64,
    },
    Sse {
        url: String,
        #[serde(default)]
        bearer_token: Option<String>,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default = "default_verify_ssl")]
        verify_ssl: bool,
        timeout: u64,
        sse_read_timeout: u64,
    },
}

fn default_verify_ssl() -> bool {
    true
}

impl ToolServerConfig {
    /// Validates timeout bounds, strips CR/LF/TAB from bearer tokens and
    /// rejects a manually-supplied `Authorization` header (spec §6.4).
    pub fn validate(&mut self) -> Result<(), ToolClientError> {
        match &mut self.transport {
            TransportConfig::Stdio { timeout, .. } => validate_timeout(*timeout)?,
            TransportConfig::Http {
                bearer_token,
                headers,
                timeout,
                ..
            } => {
                validate_timeout(*timeout)?;
                reject_manual_authorization(headers)?;
                strip_bearer_token(bearer_token);
            }
            TransportConfig::Sse {
                bearer_token,
                headers,
                timeout,
                sse_read_timeout,
                ..
            } => {
                validate_timeout(*timeout)?;
                validate_timeout(*sse_read_timeout)?;
                reject_manual_authorization(headers)?;
                strip_bearer_token(bearer_token);
            }
        }
        Ok(())
    }
}

fn validate_timeout(timeout: u64) -> Result<(), ToolClientError> {
    if !(MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&timeout) {
        return Err(ToolClientError::InvalidConfig(format!(
            "timeout must be between {MIN_TIMEOUT_SECS} and {MAX_TIMEOUT_SECS} seconds, got {timeout}"
        )));
    }
    Ok(())
}

fn reject_manual_authorization(headers: &HashMap<String, String>) -> Result<(), ToolClientError> {
    if headers.keys().any(|k| k.eq_ignore_ascii_case("authorization")) {
        return Err(ToolClientError::InvalidConfig(
            "manual Authorization header is not allowed; use bearer_token".into(),
        ));
    }
    Ok(())
}

fn strip_bearer_token(token: &mut Option<String>) {
    if let Some(t) = token {
        *t = t.chars().filter(|c| !matches!(c, '\r' | '\n' | '\t')).collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http_config(timeout: u64) -> ToolServerConfig {
        ToolServerConfig {
            name: "kubernetes-server".into(),
            transport: TransportConfig::Http {
                url: "https://example.test".into(),
                bearer_token: Some("tok\r\nwith\tjunk".into()),
                headers: HashMap::new(),
                verify_ssl: true,
                timeout,
            },
            masking: None,
        }
    }

    #[test]
    fn bearer_token_is_stripped_of_crlf_tab() {
        let mut cfg = http_config(30);
        cfg.validate().unwrap();
        match cfg.transport {
            TransportConfig::Http { bearer_token, .. } => {
                assert_eq!(bearer_token.unwrap(), "tokwithjunk");
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn timeout_out_of_bounds_is_rejected() {
        let mut cfg = http_config(0);
        assert!(cfg.validate().is_err());
        let mut cfg = http_config(301);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn manual_authorization_header_is_rejected() {
        let mut cfg = http_config(30);
        if let TransportConfig::Http { headers, .. } = &mut cfg.transport {
            headers.insert("Authorization".into(), "Bearer xyz".into());
        }
        assert!(cfg.validate().is_err());
    }
}
