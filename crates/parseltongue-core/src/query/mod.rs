pub mod client;
pub mod disclosure;
pub mod guards;
pub mod predicate;
pub mod traverse;
