use std::collections::HashMap;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;
use ulid::Ulid;

/// One shared password for every login. Identity comes from the user name,
/// not from the credential.
#[derive(Debug)]
pub struct TutorslotAuthSource {
    password: String,
}

impl TutorslotAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for TutorslotAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

/// The acting user of a connection: its startup `user` parameter read as a
/// ULID. Anything else connects fine but can only run unscoped statements.
pub fn actor_from_metadata(metadata: &HashMap<String, String>) -> Option<Ulid> {
    metadata
        .get("user")
        .and_then(|user| Ulid::from_string(user.trim()).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actor_is_parsed_from_user() {
        let id = Ulid::new();
        let mut metadata = HashMap::new();
        metadata.insert("user".to_string(), id.to_string());
        assert_eq!(actor_from_metadata(&metadata), Some(id));
    }

    #[test]
    fn non_ulid_user_has_no_actor() {
        let mut metadata = HashMap::new();
        metadata.insert("user".to_string(), "postgres".to_string());
        assert_eq!(actor_from_metadata(&metadata), None);
        assert_eq!(actor_from_metadata(&HashMap::new()), None);
    }
}
