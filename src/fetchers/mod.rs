// =============================================================================
// fetchers/mod.rs — THE ACQUISITIONS DEPARTMENT
// =============================================================================
//
// This module is the command center for our three-headed hydra of government
// data acquisition. Each fetcher talks to a different public endpoint, each
// endpoint speaks a different dialect of "open data" (CKAN JSON, directory
// JSON, a bare CSV behind a redirect from 2009), and each one fails in its
// own artisanal way.
//
// Every fetcher goes through a circuit breaker, identifies itself with an
// honest user agent, and writes what it fetched to disk before anything
// downstream touches it. Raw bytes first, opinions later.
// =============================================================================

pub mod ckan;
pub mod opin;
pub mod registry;
