pub mod evaluate;
pub mod results;
