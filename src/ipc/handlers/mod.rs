pub mod backup;
pub mod core;
pub mod grades;
pub mod groups;
pub mod performances;
pub mod remediations;
pub mod reports;
pub mod subjects;
pub mod users;
