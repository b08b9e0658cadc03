use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: Uuid,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    pub exp: i64,
}

impl Claims {
    pub fn new(user_id: Uuid, name: Option<String>, roles: Vec<String>, ttl: Duration) -> Self {
        Self {
            sub: user_id,
            name,
            roles,
            exp: (Utc::now() + ttl).timestamp(),
        }
    }
}

pub fn encode_token(claims: &Claims, secret: &str) -> Result<String, String> {
    encode(
        &Header::default(),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| format!("JWT encode failed: {e}"))
}

pub fn decode_token(token: &str, secret: &str) -> Result<Claims, String> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|e| format!("JWT decode failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trip_keeps_roles() {
        let user = Uuid::now_v7();
        let claims = Claims::new(user, Some("Ana".into()), vec!["approver".into()], Duration::minutes(5));
        let token = encode_token(&claims, "s3cret").unwrap();
        let decoded = decode_token(&token, "s3cret").unwrap();
        assert_eq!(decoded.sub, user);
        assert_eq!(decoded.roles, vec!["approver".to_string()]);
        assert!(decode_token(&token, "other").is_err());
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let claims = Claims::new(Uuid::now_v7(), None, vec![], Duration::minutes(-10));
        let token = encode_token(&claims, "s3cret").unwrap();
        assert!(decode_token(&token, "s3cret").is_err());
    }
}
