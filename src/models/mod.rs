pub mod job;
pub mod verdict;
pub mod verification;
