//! Signed tokens: capability tokens handed to instances and access tokens
//! presented by callers.

use std::collections::BTreeSet;
use std::time::Duration;

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use wsman_model::{Caller, WorkspaceConfig};

const ISSUER: &str = "wsman";
const INSTANCE_AUDIENCE: &str = "wsman-instance";
const ACCESS_AUDIENCE: &str = "wsman-web";

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token rejected: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InstanceClaims {
    pub sub: String,
    pub workspace: String,
    pub permissions: Vec<String>,
    pub exp: usize,
    pub iat: usize,
    pub iss: String,
    pub aud: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct AccessClaims {
    sub: String,
    #[serde(default)]
    roles: BTreeSet<String>,
    exp: usize,
    iat: usize,
    iss: String,
    aud: String,
}

pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    instance_ttl: Duration,
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("instance_ttl", &self.instance_ttl)
            .finish_non_exhaustive()
    }
}

fn timestamps(ttl: Duration) -> (usize, usize) {
    let now = chrono::Utc::now().timestamp().max(0) as usize;
    (now, now + ttl.as_secs() as usize)
}

fn validation(audience: &str) -> Validation {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_audience(&[audience]);
    validation.set_issuer(&[ISSUER]);
    validation
}

/// Permission strings for an instance of `workspace`.
pub fn instance_permissions(workspace: &WorkspaceConfig, repository_write: bool) -> Vec<String> {
    let mut permissions = vec![format!("workspace/{}/config:read", workspace.id)];
    let access = if repository_write { "write" } else { "read" };
    for repo in &workspace.repositories {
        permissions.push(format!("repository/{}/{access}", repo.id));
    }
    permissions
}

impl TokenIssuer {
    pub fn new(secret: &[u8], instance_ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            instance_ttl,
        }
    }

    pub fn mint_instance_token(
        &self,
        instance: &str,
        workspace: &WorkspaceConfig,
        repository_write: bool,
    ) -> Result<String, TokenError> {
        let (iat, exp) = timestamps(self.instance_ttl);
        let claims = InstanceClaims {
            sub: instance.to_string(),
            workspace: workspace.id.to_string(),
            permissions: instance_permissions(workspace, repository_write),
            exp,
            iat,
            iss: ISSUER.to_string(),
            aud: INSTANCE_AUDIENCE.to_string(),
        };
        Ok(jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?)
    }

    pub fn decode_instance_token(&self, token: &str) -> Result<InstanceClaims, TokenError> {
        let data = jsonwebtoken::decode::<InstanceClaims>(token, &self.decoding, &validation(INSTANCE_AUDIENCE))?;
        Ok(data.claims)
    }

    pub fn mint_access_token(&self, caller: &Caller, ttl: Duration) -> Result<String, TokenError> {
        let (iat, exp) = timestamps(ttl);
        let claims = AccessClaims {
            sub: caller.user_id.clone(),
            roles: caller.roles.clone(),
            exp,
            iat,
            iss: ISSUER.to_string(),
            aud: ACCESS_AUDIENCE.to_string(),
        };
        Ok(jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?)
    }

    pub fn validate_access_token(&self, token: &str) -> Result<Caller, TokenError> {
        let data = jsonwebtoken::decode::<AccessClaims>(token, &self.decoding, &validation(ACCESS_AUDIENCE))?;
        Ok(Caller {
            user_id: data.claims.sub,
            roles: data.claims.roles,
        })
    }
}
