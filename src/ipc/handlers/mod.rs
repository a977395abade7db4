pub mod classes;
pub mod core;
pub mod evaluations;
pub mod grades;
pub mod reports;
pub mod settings;
pub mod students;
pub mod subjects;
pub mod years;
