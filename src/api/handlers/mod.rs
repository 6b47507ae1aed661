pub mod core;
pub mod grades;
pub mod join;
pub mod projects;
pub mod sections;
pub mod telegram;
