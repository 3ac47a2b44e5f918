pub mod difference;
pub mod hash;

pub use difference::DifferenceAnalyzer;
pub use hash::HashAnalyzer;
