use serde::{Deserialize, Serialize};

/// A user record as stored in the directory document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub name: String,
    pub email: String,
    pub address: String,
    pub phone: String,
}

/// User fields before an id has been assigned
///
/// This is both the `create-user` tool input shape and the shape a
/// sampled reply must parse into (all four fields required strings).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub address: String,
    pub phone: String,
}

impl NewUser {
    /// Attach an assigned id
    pub fn with_id(self, id: u64) -> User {
        User {
            id,
            name: self.name,
            email: self.email,
            address: self.address,
            phone: self.phone,
        }
    }
}
