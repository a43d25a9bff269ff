//! Test users and payload generation

use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};

/// A user the write workloads create
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestUser {
    pub name: &'static str,
    pub email: &'static str,
    pub password: &'static str,
    pub user_type: &'static str,
}

impl TestUser {
    /// Creation payload using `email` in place of the fixture email
    pub fn payload(&self, email: &str) -> Value {
        json!({
            "name": self.name,
            "email": email,
            "password": self.password,
            "userType": self.user_type,
        })
    }
}

pub const TEST_USERS: [TestUser; 5] = [
    TestUser {
        name: "João Silva",
        email: "joao@test.com",
        password: "123456",
        user_type: "Admin",
    },
    TestUser {
        name: "Maria Santos",
        email: "maria@test.com",
        password: "123456",
        user_type: "User",
    },
    TestUser {
        name: "Pedro Costa",
        email: "pedro@test.com",
        password: "123456",
        user_type: "Admin",
    },
    TestUser {
        name: "Ana Oliveira",
        email: "ana@test.com",
        password: "123456",
        user_type: "User",
    },
    TestUser {
        name: "Carlos Lima",
        email: "carlos@test.com",
        password: "123456",
        user_type: "Manager",
    },
];

static EMAIL_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Pick a fixture uniformly
pub fn random_user() -> TestUser {
    *TEST_USERS
        .choose(&mut rand::thread_rng())
        .unwrap_or(&TEST_USERS[0])
}

/// Email unique within the process: the local part gains a millisecond
/// timestamp, a sequence number and a random suffix
pub fn unique_email(base: &str) -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let seq = EMAIL_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let random: u32 = rand::thread_rng().gen_range(0..1_000);
    match base.split_once('@') {
        Some((local, domain)) => format!("{}_{}_{}_{}@{}", local, millis, seq, random, domain),
        None => format!("{}_{}_{}_{}", base, millis, seq, random),
    }
}
