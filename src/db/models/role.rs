use serde::{Deserialize, Serialize};

/// Platform role as asserted by the authentication service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum UserRole {
    Aluno,
    Professor,
    Mentor,
    Admin,
}

impl UserRole {
    /// Convert from string (case-insensitive)
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "aluno" => Some(UserRole::Aluno),
            "professor" => Some(UserRole::Professor),
            "mentor" => Some(UserRole::Mentor),
            "admin" => Some(UserRole::Admin),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UserRole::Aluno => "aluno",
            UserRole::Professor => "professor",
            UserRole::Mentor => "mentor",
            UserRole::Admin => "admin",
        }
    }
}

impl From<UserRole> for String {
    fn from(role: UserRole) -> Self {
        role.as_str().to_string()
    }
}

impl TryFrom<&str> for UserRole {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::from_str(value).ok_or_else(|| format!("Invalid role: {}", value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_case_insensitively() {
        assert_eq!(UserRole::from_str("PROFESSOR"), Some(UserRole::Professor));
        assert_eq!(UserRole::from_str("Aluno"), Some(UserRole::Aluno));
        assert_eq!(UserRole::from_str("guest"), None);
    }

    #[test]
    fn serializes_lowercase() {
        let json = serde_json::to_string(&UserRole::Mentor).unwrap();
        assert_eq!(json, "\"mentor\"");
        assert_eq!(String::from(UserRole::Admin), "admin");
    }
}
