//! Built-in `logger` module: writes every `TEXT` message it receives to the
//! tracing pipeline, tagged with the sender's handle.

use super::message::{Message, MessageType};
use super::service::{Context, Service};
use crate::types::Result;

#[derive(Debug, Default)]
pub struct Logger {
    lines: u64,
}

impl Service for Logger {
    fn init(&mut self, ctx: &mut Context<'_>, args: &str) -> Result<()> {
        let name = if args.is_empty() { ".logger" } else { args };
        ctx.kernel().bind_name(ctx.handle(), name)?;
        Ok(())
    }

    fn handle(&mut self, _ctx: &mut Context<'_>, msg: &mut Message) {
        if msg.kind != MessageType::TEXT {
            tracing::debug!(source = %msg.source, kind = %msg.kind, "logger ignored non-text message");
            return;
        }
        self.lines += 1;
        tracing::info!(
            source = %msg.source,
            "{}",
            String::from_utf8_lossy(msg.payload())
        );
    }

    fn signal(&mut self, ctx: &mut Context<'_>, signal: i32) {
        tracing::info!(handle = %ctx.handle(), signal, lines = self.lines, "logger signalled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{Kernel, SendFlags};
    use crate::types::{Config, Handle};
    use bytes::Bytes;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_logger_writes_text_messages() {
        let kernel = Kernel::new(Config::default()).unwrap();
        let logger = kernel.launch("logger", "").unwrap();
        assert_eq!(kernel.query_name(".logger"), Some(logger));

        kernel
            .send(
                Handle::NONE,
                logger,
                MessageType::TEXT,
                0,
                Bytes::from_static(b"hello from the kernel"),
                SendFlags::NONE,
            )
            .unwrap();
        kernel.run_until_idle();
        assert!(logs_contain("hello from the kernel"));
        assert_eq!(kernel.stats().consumed, 1);
    }

    #[test]
    fn test_second_logger_with_same_name_fails_to_launch() {
        let kernel = Kernel::new(Config::default()).unwrap();
        assert!(kernel.launch("logger", "").is_some());
        assert!(kernel.launch("logger", "").is_none());
        assert!(kernel.launch("logger", ".audit").is_some());
        assert_eq!(kernel.service_count(), 2);
    }
}
