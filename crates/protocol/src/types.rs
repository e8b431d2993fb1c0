use serde::{Deserialize, Serialize};

/// Permission set carried in a verified token, mirroring the
/// `canRead`/`canWrite`/`isAdmin` claim names used by the original
/// JS/Python/TS clients so tokens stay interoperable across ports.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentPermissions {
    #[serde(rename = "canRead")]
    pub can_read: Vec<String>,
    #[serde(rename = "canWrite")]
    pub can_write: Vec<String>,
    #[serde(rename = "isAdmin")]
    pub is_admin: bool,
}

impl DocumentPermissions {
    #[must_use]
    pub fn anonymous() -> Self {
        Self {
            can_read: vec!["*".to_string()],
            can_write: vec![],
            is_admin: false,
        }
    }

    #[must_use]
    pub fn admin() -> Self {
        Self {
            can_read: vec!["*".to_string()],
            can_write: vec!["*".to_string()],
            is_admin: true,
        }
    }

    #[must_use]
    pub fn can_read(&self, document_id: &str) -> bool {
        self.is_admin
            || self.can_read.iter().any(|d| d == "*")
            || self.can_read.iter().any(|d| d == document_id)
    }

    #[must_use]
    pub fn can_write(&self, document_id: &str) -> bool {
        self.is_admin
            || self.can_write.iter().any(|d| d == "*")
            || self.can_write.iter().any(|d| d == document_id)
    }
}

/// Decoded JWT payload, mirroring the Python `TokenPayload` dataclass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPayload {
    #[serde(rename = "userId")]
    pub user_id: String,
    pub permissions: DocumentPermissions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub iat: i64,
    pub exp: i64,
}
