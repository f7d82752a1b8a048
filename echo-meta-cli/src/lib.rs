//! Command line front end for the Greeter echo service.
//!
//! Every subcommand starts the server and a client in the same process, performs one kind of
//! call and prints the replies along with the header and trailer metadata.

#[macro_use]
mod command;
mod call;
pub mod context;
pub mod model;
