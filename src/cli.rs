//! Command-line interface for asr-note

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::audio::AudioSource;
use crate::billing::{Credentials, LoginMode};

/// Streaming voice notes over a recognition gateway
#[derive(Parser, Debug)]
#[command(name = "asr-note", version, about = "Streaming voice notes")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<String>,

    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(flatten)]
    pub account: AccountArgs,
}

/// How to authenticate against the billing service
#[derive(Args, Debug, Default, Clone)]
pub struct AccountArgs {
    /// Use this token instead of the stored one
    #[arg(long, global = true, value_name = "TOKEN")]
    pub token: Option<String>,

    /// Log in with this username when no valid token is available
    #[arg(long, global = true, requires = "password")]
    pub username: Option<String>,

    #[arg(long, global = true, requires = "username")]
    pub password: Option<String>,

    /// Create the account instead of logging in
    #[arg(long, global = true, requires = "username")]
    pub register: bool,

    /// Account file holding the token between runs
    #[arg(long, global = true, value_name = "PATH")]
    pub account_file: Option<PathBuf>,
}

impl AccountArgs {
    pub fn credentials(&self) -> Option<Credentials> {
        let (username, password) = (self.username.as_ref()?, self.password.as_ref()?);
        let mode = if self.register {
            LoginMode::Register
        } else {
            LoginMode::Login
        };
        Some(Credentials::new(mode, username, password))
    }
}

/// Where audio comes from
#[derive(Args, Debug, Clone)]
#[group(required = true, multiple = false)]
pub struct SourceArgs {
    /// Replay a WAV file as the microphone
    #[arg(long, value_name = "FILE")]
    pub wav: Option<PathBuf>,

    /// Capture from the default input device
    #[arg(long)]
    pub mic: bool,
}

impl SourceArgs {
    pub fn source(&self) -> AudioSource {
        match &self.wav {
            Some(path) => AudioSource::File(path.clone()),
            None => AudioSource::Microphone,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Record one voice note and print the transcript
    Record {
        #[command(flatten)]
        source: SourceArgs,

        /// Stop after this many seconds
        #[arg(long, value_name = "SECONDS")]
        duration: Option<u64>,

        /// Write the transcript here as well as stdout
        #[arg(long, short, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Serve the local control API
    Serve {
        #[command(flatten)]
        source: SourceArgs,

        /// Override the configured port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Show the account balance
    Balance,

    /// Apply a top-up code
    Redeem {
        code: String,
    },

    /// Log out and forget the stored token
    Logout,
}
