//! User accounts and bearer tokens: register with email verification,
//! login issuing an HS256 JWT, and token authentication for every
//! protected endpoint.

pub mod mailer;

pub use mailer::{LogMailer, Mailer};

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::config::AuthConfig;
use crate::error::{OrchestratorError, Result};

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserRecord {
    email: String,
    password_hash: String,
    salt: String,
    verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    verification_code: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct UserFile {
    users: HashMap<String, UserRecord>,
}

pub struct AuthService {
    path: PathBuf,
    users: RwLock<HashMap<String, UserRecord>>,
    encoding: EncodingKey,
    decoding: DecodingKey,
    token_ttl: Duration,
    mailer: Arc<dyn Mailer>,
}

impl AuthService {
    pub fn new(data_dir: &PathBuf, config: &AuthConfig, mailer: Arc<dyn Mailer>) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join("users.json");
        let users = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str::<UserFile>(&content)?.users
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            users: RwLock::new(users),
            encoding: EncodingKey::from_secret(config.jwt_secret.as_bytes()),
            decoding: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            token_ttl: Duration::hours(config.token_ttl_hours),
            mailer,
        })
    }

    /// Create an unverified account and send the verification code.
    /// Re-registering an unverified address refreshes the code.
    pub fn register(&self, email: &str, password: &str) -> Result<()> {
        if !email.contains('@') {
            return Err(OrchestratorError::ValidationFailed(
                "email address is not valid".into(),
            ));
        }
        if password.len() < 8 {
            return Err(OrchestratorError::ValidationFailed(
                "password must be at least 8 characters".into(),
            ));
        }

        let mut users = self.users.write().expect("user table poisoned");
        if users.get(email).map(|u| u.verified).unwrap_or(false) {
            return Err(OrchestratorError::ValidationFailed(
                "this address is already registered".into(),
            ));
        }

        let salt = random_salt();
        let code = format!("{:06}", rand::thread_rng().gen_range(0..1_000_000u32));
        users.insert(
            email.to_string(),
            UserRecord {
                email: email.to_string(),
                password_hash: hash_password(&salt, password),
                salt,
                verified: false,
                verification_code: Some(code.clone()),
                created_at: Utc::now(),
            },
        );
        self.persist(&users)?;
        drop(users);

        self.mailer.send(
            email,
            "Verify your account",
            &format!("Your verification code is {code}"),
        )?;
        Ok(())
    }

    pub fn verify(&self, email: &str, code: &str) -> Result<()> {
        let mut users = self.users.write().expect("user table poisoned");
        let user = users
            .get_mut(email)
            .ok_or_else(|| OrchestratorError::NotFound(format!("account {email}")))?;
        if user.verification_code.as_deref() != Some(code) {
            return Err(OrchestratorError::ValidationFailed(
                "verification code does not match".into(),
            ));
        }
        user.verified = true;
        user.verification_code = None;
        self.persist(&users)
    }

    /// Issue a bearer token for a verified account.
    pub fn login(&self, email: &str, password: &str) -> Result<String> {
        let users = self.users.read().expect("user table poisoned");
        let user = users.get(email).ok_or(OrchestratorError::Unauthorized)?;
        if !user.verified || hash_password(&user.salt, password) != user.password_hash {
            return Err(OrchestratorError::Unauthorized);
        }

        let now = Utc::now();
        let claims = Claims {
            sub: user.email.clone(),
            iat: now.timestamp(),
            exp: (now + self.token_ttl).timestamp(),
        };
        jsonwebtoken::encode(&Header::default(), &claims, &self.encoding)
            .map_err(|_| OrchestratorError::Unauthorized)
    }

    /// Resolve a bearer token to the owning identity.
    pub fn authenticate(&self, token: &str) -> Result<String> {
        let data =
            jsonwebtoken::decode::<Claims>(token, &self.decoding, &Validation::default())
                .map_err(|_| OrchestratorError::Unauthorized)?;
        Ok(data.claims.sub)
    }

    fn persist(&self, users: &HashMap<String, UserRecord>) -> Result<()> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| OrchestratorError::Storage("users.json has no parent".into()))?;
        let mut tmp = NamedTempFile::new_in(parent)?;
        let file = UserFile {
            users: users.clone(),
        };
        tmp.write_all(serde_json::to_string_pretty(&file)?.as_bytes())?;
        tmp.as_file().sync_data()?;
        tmp.persist(&self.path)
            .map_err(|e| OrchestratorError::Storage(format!("users.json write failed: {e}")))?;
        Ok(())
    }

    /// Test/dev helper: fetch the pending code without an inbox.
    pub fn pending_code(&self, email: &str) -> Option<String> {
        self.users
            .read()
            .expect("user table poisoned")
            .get(email)
            .and_then(|u| u.verification_code.clone())
    }
}

fn random_salt() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes);
    base64::engine::general_purpose::STANDARD_NO_PAD.encode(bytes)
}

fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}
