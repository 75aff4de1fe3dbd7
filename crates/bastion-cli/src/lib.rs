//! Support code for the `bastion` command-line tool

pub mod config;
