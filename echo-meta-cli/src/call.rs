use clap::Parser;
use echo_meta::{driver, HelloRequest};
use faststr::FastStr;
use futures::Stream;

use crate::{
    command::CliCommand,
    context::{print_metadata, print_outcome, print_reply, print_title, Context},
};

fn requests(name: &str, count: usize) -> impl Stream<Item = HelloRequest> + Send + 'static {
    let name = FastStr::new(name);
    futures::stream::iter((0..count).map(move |_| HelloRequest::new(name.clone())))
}

#[derive(Parser, Debug)]
#[command(about = "make a unary call")]
pub struct Unary {
    #[arg(long = "name", default_value = "unaryCall", help = "The name to greet.")]
    pub name: String,
}

impl CliCommand for Unary {
    fn run(&self, cx: Context) -> anyhow::Result<()> {
        let client = cx.connect();
        let resp = cx.block_on(client.unary_echo(HelloRequest::new(FastStr::new(&self.name))))?;
        print_metadata("header", resp.metadata());
        print_reply(resp.get_ref());
        print_metadata("trailer", resp.trailers());
        Ok(())
    }
}

#[derive(Parser, Debug)]
#[command(about = "make a server-streaming call, the server replies `--count` times")]
pub struct ServerStreaming {
    #[arg(long = "name", default_value = "serverStreamingCall", help = "The name to greet.")]
    pub name: String,
}

impl CliCommand for ServerStreaming {
    fn run(&self, cx: Context) -> anyhow::Result<()> {
        let client = cx.connect();
        let outcome = cx.block_on(async {
            let stream = client
                .server_streaming_echo(HelloRequest::new(FastStr::new(&self.name)))
                .await?;
            driver::server_streaming(stream).await
        })?;
        print_outcome(&outcome);
        Ok(())
    }
}

#[derive(Parser, Debug)]
#[command(about = "make a client-streaming call sending `--count` requests")]
pub struct ClientStreaming {
    #[arg(long = "name", default_value = "clientStreamWithMetadata", help = "The name to greet.")]
    pub name: String,
}

impl CliCommand for ClientStreaming {
    fn run(&self, cx: Context) -> anyhow::Result<()> {
        let client = cx.connect();
        let outcome = cx.block_on(async {
            let stream = client.client_streaming_echo().await?;
            driver::client_streaming(stream, requests(&self.name, cx.count)).await
        })?;
        print_outcome(&outcome);
        Ok(())
    }
}

#[derive(Parser, Debug)]
#[command(about = "make a bidirectional-streaming call sending `--count` requests")]
pub struct Bidirectional {
    #[arg(
        long = "name",
        default_value = "bidirectionalStreamWithMetadata",
        help = "The name to greet."
    )]
    pub name: String,
}

impl CliCommand for Bidirectional {
    fn run(&self, cx: Context) -> anyhow::Result<()> {
        let client = cx.connect();
        let outcome = cx.block_on(async {
            let stream = client.bidirectional_streaming_echo().await?;
            driver::bidirectional(stream, requests(&self.name, cx.count)).await
        })?;
        print_outcome(&outcome);
        Ok(())
    }
}

#[derive(Parser, Debug)]
#[command(about = "make all four calls one after another")]
pub struct All {}

impl CliCommand for All {
    fn run(&self, cx: Context) -> anyhow::Result<()> {
        print_title("unary");
        Unary {
            name: "unaryCall".into(),
        }
        .run(cx.clone())?;
        print_title("server streaming");
        ServerStreaming {
            name: "serverStreamingCall".into(),
        }
        .run(cx.clone())?;
        print_title("client streaming");
        ClientStreaming {
            name: "clientStreamWithMetadata".into(),
        }
        .run(cx.clone())?;
        print_title("bidirectional");
        Bidirectional {
            name: "bidirectionalStreamWithMetadata".into(),
        }
        .run(cx)
    }
}
