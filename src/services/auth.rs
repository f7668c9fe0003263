//! Accounts and the token capability.
//!
//! The media endpoints consume exactly one thing from this module:
//! `validate(token) -> TokenIdentity`. The rest exists so tokens have a
//! place to come from: account rows, password checks, and issuance at
//! registration and login.

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::models::{AuthResponse, CreateUserRequest, LoginRequest, User, UserRole};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

/// What a validated token proves: which user is asking, and whether they
/// hold the admin role. This is the whole identity surface the streaming
/// core ever sees.
#[derive(Debug, Clone, Copy)]
pub struct TokenIdentity {
    pub user_id: Uuid,
    pub admin: bool,
}

/// Wire shape of the JWT payload. Kept private; everything outside this
/// module works with `TokenIdentity`.
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: Uuid,
    adm: bool,
    iat: i64,
    exp: i64,
}

pub struct AuthService {
    db: PgPool,
    jwt_secret: String,
    token_ttl: Duration,
}

impl AuthService {
    pub fn new(db: PgPool, config: &Config) -> Self {
        Self {
            db,
            jwt_secret: config.jwt_secret.clone(),
            token_ttl: Duration::hours(config.token_ttl_hours),
        }
    }

    pub async fn register(&self, req: CreateUserRequest) -> Result<AuthResponse> {
        let password_hash = hash_password(&req.password)?;

        // The first account on a fresh install is the admin; everyone after
        // that is a listener until promoted in the database
        let first_account: bool = sqlx::query_scalar("SELECT NOT EXISTS (SELECT 1 FROM users)")
            .fetch_one(&self.db)
            .await?;
        let role = if first_account {
            UserRole::Admin
        } else {
            UserRole::Listener
        };

        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (username, email, password_hash, role)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(&req.username)
        .bind(&req.email)
        .bind(&password_hash)
        .bind(&role)
        .fetch_one(&self.db)
        .await
        .map_err(|e| {
            let constraint_violation = e
                .as_database_error()
                .and_then(|db| db.constraint())
                .is_some();
            if constraint_violation {
                AppError::Validation("Username or email already taken".to_string())
            } else {
                AppError::Database(e)
            }
        })?;

        self.respond_with_token(user)
    }

    pub async fn login(&self, req: LoginRequest) -> Result<AuthResponse> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE username = $1")
            .bind(&req.username)
            .fetch_optional(&self.db)
            .await?
            .ok_or(AppError::InvalidCredentials)?;

        verify_password(&req.password, &user.password_hash)?;

        // A failed timestamp update must not block the login
        if let Err(e) = sqlx::query("UPDATE users SET last_login = NOW() WHERE id = $1")
            .bind(user.id)
            .execute(&self.db)
            .await
        {
            tracing::warn!(user = %user.username, error = %e, "failed to record last login");
        }

        self.respond_with_token(user)
    }

    /// The identity capability the media endpoints consume: token in,
    /// user id and admin bit out.
    pub fn validate(&self, token: &str) -> Result<TokenIdentity> {
        validate_token(&self.jwt_secret, token)
    }

    pub async fn get_user(&self, user_id: Uuid) -> Result<User> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| AppError::NotFound("User not found".to_string()))
    }

    fn respond_with_token(&self, user: User) -> Result<AuthResponse> {
        let identity = TokenIdentity {
            user_id: user.id,
            admin: user.role == UserRole::Admin,
        };
        let token = issue_token(&self.jwt_secret, identity, self.token_ttl)?;
        Ok(AuthResponse {
            token,
            user: user.into(),
        })
    }
}

pub(crate) fn issue_token(secret: &str, identity: TokenIdentity, ttl: Duration) -> Result<String> {
    let now = Utc::now();
    let claims = Claims {
        sub: identity.user_id,
        adm: identity.admin,
        iat: now.timestamp(),
        exp: (now + ttl).timestamp(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::Internal(anyhow::anyhow!("signing token: {}", e)))
}

pub(crate) fn validate_token(secret: &str, token: &str) -> Result<TokenIdentity> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| {
        // The reason stays in the logs; clients only learn "no"
        tracing::debug!(error = %e, "rejected token");
        AppError::Unauthorized
    })?;

    Ok(TokenIdentity {
        user_id: data.claims.sub,
        admin: data.claims.adm,
    })
}

fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AppError::Internal(anyhow::anyhow!("hashing password: {}", e)))
}

fn verify_password(password: &str, stored_hash: &str) -> Result<()> {
    let parsed = PasswordHash::new(stored_hash)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("stored hash unparseable: {}", e)))?;

    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .map_err(|_| AppError::InvalidCredentials)
}
