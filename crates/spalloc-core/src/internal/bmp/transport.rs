use crate::internal::geometry::Direction;

/// Connection to one BMP.
pub trait BmpTransport: Send {
    fn set_power(&mut self, boards: &[u32], on: bool) -> crate::Result<()>;
    fn set_link_enabled(&mut self, board: u32, direction: Direction, enabled: bool)
    -> crate::Result<()>;
}

/// Creates transports for BMP workers.
pub trait BmpConnector: Send + Sync {
    fn connect(&self, hostname: &str) -> crate::Result<Box<dyn BmpTransport>>;
}

/// Connector whose transports only log the commands they are given.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingConnector;

impl BmpConnector for LoggingConnector {
    fn connect(&self, hostname: &str) -> crate::Result<Box<dyn BmpTransport>> {
        Ok(Box::new(LoggingTransport {
            hostname: hostname.to_string(),
        }))
    }
}

struct LoggingTransport {
    hostname: String,
}

impl BmpTransport for LoggingTransport {
    fn set_power(&mut self, boards: &[u32], on: bool) -> crate::Result<()> {
        log::info!(
            "BMP {}: power {} boards {:?}",
            self.hostname,
            if on { "on" } else { "off" },
            boards
        );
        Ok(())
    }

    fn set_link_enabled(
        &mut self,
        board: u32,
        direction: Direction,
        enabled: bool,
    ) -> crate::Result<()> {
        log::info!(
            "BMP {}: board {board} link {direction} enabled={enabled}",
            self.hostname
        );
        Ok(())
    }
}
