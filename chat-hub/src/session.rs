//! Authentication boundary in front of the hub.
//!
//! The hub never authenticates anyone. Whatever sits in front of it resolves
//! a [`Session`] first and hands it to [`Client::new`](crate::client::Client::new).
//! [`GuestAuthenticator`] is the stand-in used by the bundled server: it
//! accepts any reasonable display name and mints fresh ids.

use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_NAME_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
}

/// An authenticated session. `id` is a credential and is never broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    #[serde(rename = "sessionId")]
    pub id: String,
    pub user: User,
}

impl Session {
    pub fn new(id: impl Into<String>, user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            user: User {
                id: user_id.into(),
                name: name.into(),
            },
        }
    }
}

/// First frame a peer sends on the TCP transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    pub name: String,
}

/// Reply sent instead of a [`Session`] when login fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRejected {
    pub error: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("display name cannot be empty")]
    EmptyName,
    #[error("display name is longer than {} characters", MAX_NAME_LEN)]
    NameTooLong,
}

pub trait Authenticator: Send + Sync {
    fn authenticate(&self, request: &LoginRequest) -> Result<Session, AuthError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct GuestAuthenticator;

impl Authenticator for GuestAuthenticator {
    fn authenticate(&self, request: &LoginRequest) -> Result<Session, AuthError> {
        let name = request.name.trim();
        if name.is_empty() {
            return Err(AuthError::EmptyName);
        }
        if name.chars().count() > MAX_NAME_LEN {
            return Err(AuthError::NameTooLong);
        }

        Ok(Session::new(nanoid!(), nanoid!(10), name))
    }
}
