#[macro_use]
extern crate tracing;

use clap::Parser;
use eyre::{OptionExt, Result, WrapErr};
use pipekit::{AsyncPipe, IoContext, PipeConfig, StreamBuf};
use std::{cell::RefCell, path::PathBuf, rc::Rc};
use tracing_subscriber::EnvFilter;

/// Relays a single line from one existing named pipe to another.
#[derive(Clone, Debug, Parser)]
#[command(name = "echo-named-pipe", version)]
struct EchoArgs {
    /// The named pipe to read the line from.
    #[arg(long, value_name = "PATH")]
    input: PathBuf,

    /// The named pipe to write the line to.
    #[arg(long, value_name = "PATH")]
    output: PathBuf,
}

impl EchoArgs {
    fn run(self) -> Result<()> {
        let config = PipeConfig::load()?;
        let ctx = IoContext::with_config(config).wrap_err("failed to create io context")?;
        let input = AsyncPipe::open_existing(&ctx, &self.input)?;
        let output = AsyncPipe::open_existing(&ctx, &self.output)?;

        let outcome = Rc::new(RefCell::new(None));
        let slot = Rc::clone(&outcome);
        ctx.spawn(async move {
            *slot.borrow_mut() = Some(relay_line(&input, &output).await);
        });
        ctx.run();

        let relayed = outcome.take().ok_or_eyre("io context stopped before the line was relayed")??;
        debug!(relayed, "done");
        Ok(())
    }
}

async fn relay_line(input: &AsyncPipe, output: &AsyncPipe) -> Result<usize> {
    let buf = StreamBuf::new();
    let read = input.read_until(&buf, b'\n').await.wrap_err("failed to read line")?;
    trace!(read, "read line");
    let line = buf.read_until(b'\n').ok_or_eyre("line vanished from the buffer")?;
    output.write_all(line).await.wrap_err("failed to write line")
}

fn main() -> Result<()> {
    let _ = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
    EchoArgs::parse().run()
}
