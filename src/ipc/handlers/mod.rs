pub mod auth;
pub mod core;
pub mod courses;
pub mod grades;
pub mod logs;
pub mod schedules;
pub mod students;
pub mod users;
