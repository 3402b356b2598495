//! End-to-end tests through the public database API.
//!
//! Each file covers one scenario. Randomized tests use seeded generators so
//! failures reproduce.

#![cfg(test)]

mod helpers;

mod test_concurrent_commits;
mod test_conflicts;
mod test_crash_prefixes;
mod test_failed_operations;
mod test_large_commits;
mod test_random_operations;
mod test_redirects;
mod test_reopen;
mod test_tools;
