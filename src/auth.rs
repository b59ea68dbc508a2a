use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

const HASH_SCHEME: &str = "sha256";
const HASH_ITERATIONS: u32 = 120_000;

/// Roles form a total order; permission checks compare numeric levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Guest,
    Student,
    Teacher,
    Admin,
}

impl Role {
    pub fn level(self) -> u8 {
        match self {
            Role::Guest => 0,
            Role::Student => 1,
            Role::Teacher => 2,
            Role::Admin => 3,
        }
    }

    /// Lenient mapping for stored role strings; unknown names rank as
    /// guest (level 0).
    pub fn from_name(name: &str) -> Role {
        match name {
            "admin" => Role::Admin,
            "teacher" => Role::Teacher,
            "student" => Role::Student,
            _ => Role::Guest,
        }
    }

    /// Strict parse for user input; rejects anything outside the closed set.
    pub fn parse(name: &str) -> Option<Role> {
        match name {
            "admin" => Some(Role::Admin),
            "teacher" => Some(Role::Teacher),
            "student" => Some(Role::Student),
            "guest" => Some(Role::Guest),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Role::Guest => "guest",
            Role::Student => "student",
            Role::Teacher => "teacher",
            Role::Admin => "admin",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub username: String,
    pub role: Role,
}

/// Pure check: no principal means no access, otherwise compare levels.
pub fn has_permission(principal: Option<&Principal>, required: Role) -> bool {
    match principal {
        None => false,
        Some(p) => p.role.level() >= required.level(),
    }
}

pub fn valid_username(username: &str) -> bool {
    (3..=20).contains(&username.len())
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Policy: at least 6 characters, with at least one letter and one digit.
pub fn valid_password(password: &str) -> bool {
    password.len() >= 6
        && password.chars().any(|c| c.is_ascii_alphabetic())
        && password.chars().any(|c| c.is_ascii_digit())
}

/// Stored form: `sha256:<iterations>$<salt>$<hex digest>`.
/// The salt is random per user; iterations are recorded so old hashes
/// keep verifying if the default ever changes.
pub fn hash_password(password: &str) -> String {
    let salt = Uuid::new_v4().simple().to_string();
    let digest = derive(password, &salt, HASH_ITERATIONS);
    format!(
        "{}:{}${}${}",
        HASH_SCHEME,
        HASH_ITERATIONS,
        salt,
        hex::encode(digest)
    )
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    let Some(rest) = stored.strip_prefix("sha256:") else {
        return false;
    };
    let mut parts = rest.splitn(3, '$');
    let Some(iterations) = parts.next().and_then(|s| s.parse::<u32>().ok()) else {
        return false;
    };
    if iterations == 0 {
        return false;
    }
    let Some(salt) = parts.next() else {
        return false;
    };
    let Some(expected) = parts.next() else {
        return false;
    };
    hex::encode(derive(password, salt, iterations)) == expected
}

fn derive(password: &str, salt: &str, iterations: u32) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    let mut digest = hasher.finalize();
    for _ in 1..iterations {
        let mut h = Sha256::new();
        h.update(digest);
        digest = h.finalize();
    }
    digest.into()
}
