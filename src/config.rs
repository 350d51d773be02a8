use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{RelayError, Result};
use crate::transcoder::TranscoderConfig;

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:5000";
const DEFAULT_REDIS_URL: &str = "redis://default@127.0.0.1:6379";
const DEFAULT_STOP_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub redis_url: String,
    pub transcoder: TranscoderConfig,
    /// Delete the metadata record on an explicit stop instead of marking it inactive.
    pub remove_on_stop: bool,
}

impl Config {
    /// Reads the process environment. Call after `dotenv()` so `.env` values apply.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_addr = parse_var(&lookup, "RELAY_LISTEN_ADDR", DEFAULT_LISTEN_ADDR)?;
        let redis_url = lookup("REDIS_URL").unwrap_or_else(|| DEFAULT_REDIS_URL.to_string());

        let mut transcoder = TranscoderConfig::default();
        if let Some(program) = lookup("TRANSCODER_PROGRAM") {
            transcoder.program = program;
        }
        if let Some(args) = lookup("TRANSCODER_ARGS") {
            transcoder.args = split_args(&args)?;
        }
        if let Some(base) = lookup("TRANSCODER_OUTPUT_BASE") {
            transcoder.output_base = base.trim_end_matches('/').to_string();
        }
        let stop_timeout_ms: u64 = parse_var(
            &lookup,
            "TRANSCODER_STOP_TIMEOUT_MS",
            &DEFAULT_STOP_TIMEOUT_MS.to_string(),
        )?;
        transcoder.stop_timeout = Duration::from_millis(stop_timeout_ms);

        let remove_on_stop = parse_var(&lookup, "RELAY_REMOVE_ON_STOP", "false")?;

        Ok(Config {
            listen_addr,
            redis_url,
            transcoder,
            remove_on_stop,
        })
    }
}

/// Splits an argument template on whitespace. Single or double quotes group
/// text that contains spaces; there are no escapes.
fn split_args(raw: &str) -> Result<Vec<String>> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_arg = false;
    let mut quote = None;

    for c in raw.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_arg = true;
            }
            None if c.is_whitespace() => {
                if in_arg {
                    args.push(std::mem::take(&mut current));
                    in_arg = false;
                }
            }
            None => {
                current.push(c);
                in_arg = true;
            }
        }
    }
    if quote.is_some() {
        return Err(RelayError::Config(format!("TRANSCODER_ARGS={raw}: unclosed quote")));
    }
    if in_arg {
        args.push(current);
    }
    Ok(args)
}

fn parse_var<F, T>(lookup: &F, key: &str, default: &str) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = lookup(key).unwrap_or_else(|| default.to_string());
    raw.trim()
        .parse()
        .map_err(|e| RelayError::Config(format!("{key}={raw}: {e}")))
}
