// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::time::Duration;

//======================================================================================================================
// Constants
//======================================================================================================================

/// Smallest MSS we are willing to operate with.
pub const MIN_MSS: usize = 536;

/// Largest MSS encodable in the MSS option.
pub const MAX_MSS: usize = u16::MAX as usize;

/// Advertised MSS when none is configured (Ethernet MTU minus IP/TCP headers).
pub const DEFAULT_MSS: usize = 1460;

/// Default byte budget for each per-connection segment store.
pub const DEFAULT_SOCKETQ: u32 = 16 * 1024;

//======================================================================================================================
// Structures
//======================================================================================================================

/// TCP Configuration Descriptor
#[derive(Clone, Debug)]
pub struct TcpConfig {
    /// Advertised maximum segment size.
    advertised_mss: usize,
    /// Number of retries for the connect handshake.
    handshake_retries: usize,
    /// Interval between connect handshake retries.
    handshake_timeout: Duration,
    /// Byte budget of the inbound reassembly store.
    receive_queue_size: u32,
    /// Byte budget of the outbound segment store.
    send_queue_size: u32,
    /// Scaling factor advertised for our receive window.
    window_scale: u8,
    /// Whether we offer and honor selective acknowledgments.
    sack_enabled: bool,
    /// Whether we offer and honor the timestamp option.
    timestamps_enabled: bool,
    /// Whether new connections start with Nagle coalescing enabled.
    nagle_enabled: bool,
    /// FIN handshake watchdog and TIME-WAIT linger interval.
    linger_timeout: Duration,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl TcpConfig {
    /// Gets the advertised maximum segment size in the target [TcpConfig].
    pub fn get_advertised_mss(&self) -> usize {
        self.advertised_mss
    }

    /// Gets the number of connect handshake retries in the target [TcpConfig].
    pub fn get_handshake_retries(&self) -> usize {
        self.handshake_retries
    }

    /// Gets the connect handshake retry interval in the target [TcpConfig].
    pub fn get_handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    /// Gets the inbound store byte budget in the target [TcpConfig].
    pub fn get_receive_queue_size(&self) -> u32 {
        self.receive_queue_size
    }

    /// Gets the outbound store byte budget in the target [TcpConfig].
    pub fn get_send_queue_size(&self) -> u32 {
        self.send_queue_size
    }

    /// Gets the advertised window scale in the target [TcpConfig].
    pub fn get_window_scale(&self) -> u8 {
        self.window_scale
    }

    /// Gets whether SACK is offered in the target [TcpConfig].
    pub fn get_sack_enabled(&self) -> bool {
        self.sack_enabled
    }

    /// Gets whether timestamps are offered in the target [TcpConfig].
    pub fn get_timestamps_enabled(&self) -> bool {
        self.timestamps_enabled
    }

    /// Gets whether Nagle coalescing starts enabled in the target [TcpConfig].
    pub fn get_nagle_enabled(&self) -> bool {
        self.nagle_enabled
    }

    /// Gets the FIN linger interval in the target [TcpConfig].
    pub fn get_linger_timeout(&self) -> Duration {
        self.linger_timeout
    }

    /// Sets the advertised maximum segment size in the target [TcpConfig].
    pub fn set_advertised_mss(mut self, value: usize) -> Self {
        assert!(value >= MIN_MSS);
        assert!(value <= MAX_MSS);
        self.advertised_mss = value;
        self
    }

    /// Sets the number of connect handshake retries in the target [TcpConfig].
    pub fn set_handshake_retries(mut self, value: usize) -> Self {
        assert!(value > 0);
        self.handshake_retries = value;
        self
    }

    /// Sets the connect handshake retry interval in the target [TcpConfig].
    pub fn set_handshake_timeout(mut self, value: Duration) -> Self {
        assert!(value > Duration::new(0, 0));
        self.handshake_timeout = value;
        self
    }

    /// Sets the inbound store byte budget in the target [TcpConfig].
    pub fn set_receive_queue_size(mut self, value: u32) -> Self {
        assert!(value > 0);
        self.receive_queue_size = value;
        self
    }

    /// Sets the outbound store byte budget in the target [TcpConfig].
    pub fn set_send_queue_size(mut self, value: u32) -> Self {
        assert!(value > 0);
        self.send_queue_size = value;
        self
    }

    /// Sets the advertised window scale in the target [TcpConfig].
    pub fn set_window_scale(mut self, value: u8) -> Self {
        assert!(value <= 14);
        self.window_scale = value;
        self
    }

    /// Sets whether SACK is offered in the target [TcpConfig].
    pub fn set_sack_enabled(mut self, value: bool) -> Self {
        self.sack_enabled = value;
        self
    }

    /// Sets whether timestamps are offered in the target [TcpConfig].
    pub fn set_timestamps_enabled(mut self, value: bool) -> Self {
        self.timestamps_enabled = value;
        self
    }

    /// Sets whether Nagle coalescing starts enabled in the target [TcpConfig].
    pub fn set_nagle_enabled(mut self, value: bool) -> Self {
        self.nagle_enabled = value;
        self
    }

    /// Sets the FIN linger interval in the target [TcpConfig].
    pub fn set_linger_timeout(mut self, value: Duration) -> Self {
        self.linger_timeout = value;
        self
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            advertised_mss: DEFAULT_MSS,
            handshake_retries: 3,
            handshake_timeout: Duration::from_millis(2000),
            receive_queue_size: DEFAULT_SOCKETQ,
            send_queue_size: DEFAULT_SOCKETQ,
            window_scale: 0,
            sack_enabled: true,
            timestamps_enabled: true,
            nagle_enabled: false,
            linger_timeout: Duration::from_millis(3000),
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        TcpConfig,
        DEFAULT_MSS,
        DEFAULT_SOCKETQ,
    };
    use ::anyhow::Result;
    use ::std::time::Duration;

    #[test]
    fn default_config() -> Result<()> {
        let config: TcpConfig = TcpConfig::default();
        crate::ensure_eq!(config.get_advertised_mss(), DEFAULT_MSS);
        crate::ensure_eq!(config.get_handshake_retries(), 3);
        crate::ensure_eq!(config.get_handshake_timeout(), Duration::from_millis(2000));
        crate::ensure_eq!(config.get_receive_queue_size(), DEFAULT_SOCKETQ);
        crate::ensure_eq!(config.get_send_queue_size(), DEFAULT_SOCKETQ);
        crate::ensure_eq!(config.get_window_scale(), 0);
        crate::ensure_eq!(config.get_sack_enabled(), true);
        crate::ensure_eq!(config.get_nagle_enabled(), false);
        Ok(())
    }

    #[test]
    fn builder_setters() -> Result<()> {
        let config: TcpConfig = TcpConfig::default()
            .set_advertised_mss(1200)
            .set_window_scale(2)
            .set_nagle_enabled(true);
        crate::ensure_eq!(config.get_advertised_mss(), 1200);
        crate::ensure_eq!(config.get_window_scale(), 2);
        crate::ensure_eq!(config.get_nagle_enabled(), true);
        Ok(())
    }
}
