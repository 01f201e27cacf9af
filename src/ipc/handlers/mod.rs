pub mod activities;
pub mod classes;
pub mod core;
pub mod dashboard;
pub mod grades;
pub mod plans;
pub mod portal;
pub mod reports;
pub mod schools;
pub mod setup;
pub mod students;
pub mod users;
