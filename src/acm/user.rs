// Authentication method dispatch. Methods produce an AuthUser; failures
// carry enough to shape the HTTP challenge.

use base64::Engine;
use serde::Serialize;

use super::AuthSettings;

#[derive(Clone, Debug, Serialize)]
pub struct AuthUser {
    pub user: String,
    pub authenticated: bool,
    pub groups: Vec<String>,
}

impl AuthUser {
    pub fn anonymous() -> Self {
        Self {
            user: String::new(),
            authenticated: false,
            groups: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("authentication required")]
    Required { realm: String },
    #[error("invalid credentials")]
    Failed { realm: String },
    #[error("unknown authentication method `{0}`")]
    UnknownMethod(String),
}

impl AuthError {
    pub fn realm(&self) -> Option<&str> {
        match self {
            Self::Required { realm } | Self::Failed { realm } => Some(realm),
            Self::UnknownMethod(_) => None,
        }
    }
}

/// Authenticate a request against the repo's settings. `authorization` is
/// the raw `Authorization` header, if any; `secure` requests without
/// credentials are challenged.
pub fn authenticate(
    settings: &AuthSettings,
    authorization: Option<&str>,
    secure: bool,
) -> Result<AuthUser, AuthError> {
    match settings.method.as_str() {
        "basic" => basic(settings, authorization, secure),
        "test" => Ok(AuthUser {
            user: "test".to_owned(),
            authenticated: true,
            groups: settings.test_groups.clone(),
        }),
        "none" => {
            if secure {
                Err(AuthError::Required {
                    realm: settings.realm.clone(),
                })
            } else {
                Ok(AuthUser::anonymous())
            }
        }
        other => Err(AuthError::UnknownMethod(other.to_owned())),
    }
}

fn basic(
    settings: &AuthSettings,
    authorization: Option<&str>,
    secure: bool,
) -> Result<AuthUser, AuthError> {
    let Some(header) = authorization else {
        return if secure {
            Err(AuthError::Required {
                realm: settings.realm.clone(),
            })
        } else {
            Ok(AuthUser::anonymous())
        };
    };

    let failed = || AuthError::Failed {
        realm: settings.realm.clone(),
    };

    let encoded = header
        .strip_prefix("Basic ")
        .or_else(|| header.strip_prefix("basic "))
        .ok_or_else(failed)?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|_| failed())?;
    let decoded = String::from_utf8(decoded).map_err(|_| failed())?;
    let (user, password) = decoded.split_once(':').ok_or_else(failed)?;

    match settings.users.get(user) {
        Some(entry) if entry.password == password => Ok(AuthUser {
            user: user.to_owned(),
            authenticated: true,
            groups: entry.groups.clone(),
        }),
        _ => Err(failed()),
    }
}
