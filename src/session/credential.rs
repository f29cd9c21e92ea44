//! Connection credentials and the login form they are validated from.

use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_SSH_PORT;

/// How the user authenticates against the login node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
    PasswordMfa,
    SshKey,
}

/// Authentication payload. The variant tag and its fields always agree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode")]
pub enum Auth {
    #[serde(rename = "password-mfa")]
    PasswordMfa {
        password: String,
        #[serde(rename = "mfaCode")]
        mfa_code: String,
    },
    #[serde(rename = "ssh-key")]
    SshKey {
        path: String,
        passphrase: Option<String>,
    },
}

impl Auth {
    /// Empty payload for `mode`.
    pub fn empty(mode: AuthMode) -> Self {
        match mode {
            AuthMode::PasswordMfa => Auth::PasswordMfa {
                password: String::new(),
                mfa_code: String::new(),
            },
            AuthMode::SshKey => Auth::SshKey {
                path: String::new(),
                passphrase: None,
            },
        }
    }

    pub fn mode(&self) -> AuthMode {
        match self {
            Auth::PasswordMfa { .. } => AuthMode::PasswordMfa,
            Auth::SshKey { .. } => AuthMode::SshKey,
        }
    }

    /// Switch to `mode`. Fields entered for the previous mode are dropped.
    pub fn switch_mode(&mut self, mode: AuthMode) {
        if self.mode() != mode {
            *self = Auth::empty(mode);
        }
    }
}

/// A validated connection credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub host: (String, u16),
    pub username: String,
    pub auth: Auth,
}

impl Credential {
    pub fn new(host: (String, u16), username: String, auth: Auth) -> Self {
        Self {
            host,
            username,
            auth,
        }
    }

    /// Copy suitable for persisting: the one-time MFA code is cleared.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if let Auth::PasswordMfa { mfa_code, .. } = &mut copy.auth {
            mfa_code.clear();
        }
        copy
    }
}

/// Raw port input: free text from a field, or a numeric literal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortInput {
    Number(u64),
    Text(String),
}

impl Default for PortInput {
    fn default() -> Self {
        PortInput::Text(String::new())
    }
}

/// Unvalidated login form contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialForm {
    pub hostname: String,
    #[serde(default)]
    pub port: PortInput,
    pub username: String,
    pub auth: Auth,
}

impl Default for CredentialForm {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            port: PortInput::default(),
            username: String::new(),
            auth: Auth::empty(AuthMode::PasswordMfa),
        }
    }
}

impl From<&Credential> for CredentialForm {
    fn from(credential: &Credential) -> Self {
        Self {
            hostname: credential.host.0.clone(),
            port: PortInput::Number(u64::from(credential.host.1)),
            username: credential.username.clone(),
            auth: credential.auth.clone(),
        }
    }
}

/// Validation failure attached to one form field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

fn parse_port(input: &PortInput) -> Result<u16, &'static str> {
    let value = match input {
        PortInput::Number(n) => *n,
        PortInput::Text(text) => {
            let text = text.trim();
            if text.is_empty() {
                return Ok(DEFAULT_SSH_PORT);
            }
            match text.parse::<u64>() {
                Ok(n) => n,
                Err(_) if text.parse::<f64>().is_ok_and(f64::is_finite) => {
                    return Err("Invalid port")
                }
                Err(_) => return Err("Invalid number"),
            }
        }
    };
    match u16::try_from(value) {
        Ok(port) if port > 0 => Ok(port),
        _ => Err("Invalid port"),
    }
}

/// Validate a login form into a [`Credential`], collecting every field error.
pub fn validate(form: &CredentialForm) -> Result<Credential, Vec<FieldError>> {
    let mut errors = Vec::new();

    let hostname = form.hostname.trim();
    if hostname.is_empty() {
        errors.push(FieldError::new("hostname", "Required"));
    }

    let port = match parse_port(&form.port) {
        Ok(port) => port,
        Err(message) => {
            errors.push(FieldError::new("port", message));
            DEFAULT_SSH_PORT
        }
    };

    let username = form.username.trim();
    if username.is_empty() {
        errors.push(FieldError::new("username", "Required"));
    }

    let auth = match &form.auth {
        Auth::PasswordMfa { password, mfa_code } => Auth::PasswordMfa {
            password: password.clone(),
            mfa_code: mfa_code.trim().to_string(),
        },
        Auth::SshKey { path, passphrase } => {
            if path.trim().is_empty() {
                errors.push(FieldError::new("auth.path", "Required"));
            }
            Auth::SshKey {
                path: path.trim().to_string(),
                passphrase: passphrase.clone().filter(|p| !p.is_empty()),
            }
        }
    };

    if !errors.is_empty() {
        return Err(errors);
    }

    Ok(Credential::new(
        (hostname.to_string(), port),
        username.to_string(),
        auth,
    ))
}
