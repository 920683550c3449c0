// ============================
// crates/backend-lib/src/enrollment.rs
// ============================
//! Enrollment lookup seam for course-scoped sessions.

use crate::error::AppError;
use async_trait::async_trait;
use dashmap::DashSet;
use uuid::Uuid;

/// Answers "does this user hold an active enrollment for this course?".
#[async_trait]
pub trait EnrollmentProvider: Send + Sync {
    async fn is_enrolled(&self, user_id: Uuid, course_id: Uuid) -> Result<bool, AppError>;
}

/// In-process enrollment set, used by the binary and tests.
#[derive(Default)]
pub struct MemoryEnrollments {
    entries: DashSet<(Uuid, Uuid)>,
}

impl MemoryEnrollments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enroll(&self, user_id: Uuid, course_id: Uuid) {
        self.entries.insert((user_id, course_id));
    }

    pub fn withdraw(&self, user_id: Uuid, course_id: Uuid) {
        self.entries.remove(&(user_id, course_id));
    }
}

#[async_trait]
impl EnrollmentProvider for MemoryEnrollments {
    async fn is_enrolled(&self, user_id: Uuid, course_id: Uuid) -> Result<bool, AppError> {
        Ok(self.entries.contains(&(user_id, course_id)))
    }
}
