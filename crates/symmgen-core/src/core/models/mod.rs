pub mod batch;
pub mod site_symmetry;
pub mod trajectory;
