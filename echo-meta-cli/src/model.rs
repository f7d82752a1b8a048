use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use echo_meta::metadata::DEFAULT_LOCATION;
use tokio::runtime::Handle;

use crate::{
    call::{All, Bidirectional, ClientStreaming, ServerStreaming, Unary},
    command::CliCommand,
    context::Context,
};

define_commands!(Subcommand {
    Unary,
    ServerStreaming,
    ClientStreaming,
    Bidirectional,
    All
});

#[derive(Parser, Debug)]
#[command(
    name = "echo-meta",
    author,
    version,
    about,
    rename_all = "kebab-case",
    arg_required_else_help = true,
    propagate_version = true
)]
pub struct RootCommand {
    #[arg(
        short = 'v',
        long = "verbose",
        help = "Turn on the verbose mode.",
        global = true,
        action = clap::ArgAction::Count
    )]
    pub verbose: u8,

    #[arg(
        short = 'c',
        long = "count",
        help = "How many messages the streaming side of a call carries.",
        global = true,
        default_value_t = echo_meta::greeter::STREAMING_COUNT
    )]
    pub count: usize,

    #[arg(
        short = 't',
        long = "timeout-ms",
        help = "The rpc timeout of every call, in milliseconds.",
        global = true
    )]
    pub timeout_ms: Option<u64>,

    #[arg(
        short = 'l',
        long = "location",
        help = "The location the server puts in every header.",
        global = true,
        default_value = DEFAULT_LOCATION
    )]
    pub location: String,

    #[command(subcommand)]
    subcmd: Subcommand,
}

impl RootCommand {
    pub fn run(self, handle: Handle) -> Result<()> {
        let cx = Context {
            location: self.location.clone().into(),
            count: self.count,
            timeout: self.timeout_ms.map(Duration::from_millis),
            handle,
        };
        self.subcmd.run(cx)
    }
}
