//! Command-line front end for the store.
//!
//! `dbdb DBNAME get KEY`, `dbdb DBNAME set KEY VALUE`, `dbdb DBNAME delete
//! KEY`. Exit codes: 0 ok, 1 bad args, 2 bad verb, 3 key not found. The
//! retrieved value (for `get`) goes to stdout; everything else goes to
//! stderr.

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use dbdb::{Db, DbError};

const OK: u8 = 0;
const BAD_ARGS: u8 = 1;
const BAD_VERB: u8 = 2;
const BAD_KEY: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "dbdb", about = "A single-file copy-on-write key-value store")]
struct Cli {
    /// Path to the database file
    dbname: String,
    /// get | set | delete
    verb: String,
    /// key, and for `set` the value
    #[arg(required = true, num_args = 1..=2)]
    args: Vec<String>,
}

fn usage() {
    eprintln!("Usage:");
    eprintln!("\tdbdb DBNAME get KEY");
    eprintln!("\tdbdb DBNAME set KEY VALUE");
    eprintln!("\tdbdb DBNAME delete KEY");
}

fn main() -> ExitCode {
    env_logger::init();
    let argv: Vec<String> = std::env::args().collect();
    ExitCode::from(run(&argv))
}

fn run(argv: &[String]) -> u8 {
    let cli = match Cli::try_parse_from(argv.iter().cloned()) {
        Ok(cli) => cli,
        Err(_) => {
            usage();
            return BAD_ARGS;
        }
    };

    if !matches!(cli.verb.as_str(), "get" | "set" | "delete") {
        usage();
        return BAD_VERB;
    }

    if cli.verb == "set" && cli.args.len() < 2 {
        usage();
        return BAD_ARGS;
    }

    let connected = Db::connect(&cli.dbname)
        .with_context(|| format!("opening database {:?}", cli.dbname));
    let mut db = match connected {
        Ok(db) => db,
        Err(e) => {
            eprintln!("{e:#}");
            return BAD_ARGS;
        }
    };

    let key = &cli.args[0];
    let result = match cli.verb.as_str() {
        "get" => db.get(key).map(|value| print!("{value}")),
        "set" => db.set(key, &cli.args[1]).and_then(|_| db.commit()),
        "delete" => db.delete(key).and_then(|_| db.commit()),
        _ => unreachable!("verb already validated"),
    };

    let _ = db.close();

    match result {
        Ok(()) => OK,
        Err(e) if e.is_not_found() => {
            eprintln!("Key not found");
            BAD_KEY
        }
        Err(e) => {
            eprintln!("{e}");
            BAD_ARGS
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn db_path() -> String {
        NamedTempFile::new()
            .unwrap()
            .into_temp_path()
            .to_str()
            .unwrap()
            .to_string()
    }

    fn argv(parts: &[&str]) -> Vec<String> {
        std::iter::once("dbdb".to_string())
            .chain(parts.iter().map(|s| s.to_string()))
            .collect()
    }

    #[test]
    fn scenario_s6_cli_end_to_end() {
        let path = db_path();
        assert_eq!(run(&argv(&[&path, "set", "k", "v"])), OK);
        assert_eq!(run(&argv(&[&path, "get", "k"])), OK);
        assert_eq!(run(&argv(&[&path, "get", "missing"])), BAD_KEY);
    }

    #[test]
    fn bad_verb_is_exit_code_two() {
        let path = db_path();
        assert_eq!(run(&argv(&[&path, "frobnicate", "k"])), BAD_VERB);
    }

    #[test]
    fn missing_args_is_exit_code_one() {
        assert_eq!(run(&argv(&["onlydbname"])), BAD_ARGS);
    }

    #[test]
    fn set_without_value_is_exit_code_one() {
        let path = db_path();
        assert_eq!(run(&argv(&[&path, "set", "k"])), BAD_ARGS);
    }

    #[test]
    fn delete_missing_key_is_exit_code_three() {
        let path = db_path();
        assert_eq!(run(&argv(&[&path, "delete", "nope"])), BAD_KEY);
    }
}
