use std::{future::Future, time::Duration};

use colored::Colorize;
use echo_meta::{
    client::{StreamCall, UnaryCall},
    driver::StreamOutcome,
    greeter::{EchoGreeter, GreeterServer},
    layer::{
        client::{ClientStreamService, ClientUnaryService},
        ClientStreamLayer, ClientUnaryLayer, ServerMetadataLayer,
    },
    transport::LocalTransport,
    GreeterClient, GreeterClientBuilder, HelloReply, HelloRequest, MetadataMap, Server,
};
use faststr::FastStr;
use tokio::runtime::Handle;

pub type Transport = LocalTransport<HelloRequest, HelloReply>;
pub type EchoClient = GreeterClient<
    ClientUnaryService<UnaryCall<Transport>>,
    ClientStreamService<StreamCall<Transport>>,
>;

#[derive(Debug, Clone)]
pub struct Context {
    pub location: FastStr,
    pub count: usize,
    pub timeout: Option<Duration>,
    pub handle: Handle,
}

impl Context {
    /// Starts an echo server on the runtime and returns a client connected to it.
    ///
    /// The server stops once the returned client and all its clones are dropped.
    pub fn connect(&self) -> EchoClient {
        let (transport, incoming) = LocalTransport::new();
        let server = Server::new(GreeterServer::new(
            EchoGreeter::new().streaming_count(self.count),
        ))
        .layer(ServerMetadataLayer::new().location(self.location.clone()));
        self.handle.spawn(async move {
            if let Err(e) = server.run(incoming).await {
                tracing::error!("[ECHO] server exited: {e}");
            }
        });

        let mut builder = GreeterClientBuilder::new(transport);
        if let Some(timeout) = self.timeout {
            builder = builder.rpc_timeout(timeout);
        }
        builder
            .unary_layer(ClientUnaryLayer::new())
            .stream_layer(ClientStreamLayer::new())
            .build()
    }

    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }
}

pub fn print_title(title: &str) {
    println!("{}", format!("--- {title} ---").bold());
}

pub fn print_reply(reply: &HelloReply) {
    println!("response:");
    println!(" - {}", reply.message.green());
}

pub fn print_metadata(section: &str, metadata: &MetadataMap) {
    println!("{section}:");
    if metadata.is_empty() {
        println!("   {}", "<empty>".dimmed());
    }
    for (key, values) in metadata.iter() {
        println!(" {}:", key.cyan());
        for (i, value) in values.iter().enumerate() {
            println!("   {i}. {value}");
        }
    }
}

pub fn print_outcome(outcome: &StreamOutcome<HelloReply>) {
    print_metadata("header", &outcome.header);
    println!("responses:");
    for reply in &outcome.messages {
        println!(" - {}", reply.message.green());
    }
    print_metadata("trailer", &outcome.trailer);
}
