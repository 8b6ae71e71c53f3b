//! HTTP/2 connection settings.

use crate::config::Http2Config;
use crate::frame::{self, Setting, SettingId, SettingsFrame};

/// One side's SETTINGS values.
///
/// A connection keeps two: what we advertise to the peer, and what the peer
/// advertised to us (starting from the RFC 7540 defaults until its first
/// SETTINGS frame arrives).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub header_table_size: u32,
    pub enable_push: bool,
    /// `u32::MAX` when the peer set no limit.
    pub max_concurrent_streams: u32,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    /// `u32::MAX` when the peer set no limit.
    pub max_header_list_size: u32,
}

impl Default for ConnectionSettings {
    /// Protocol defaults, which apply to a peer that has not sent SETTINGS.
    fn default() -> Self {
        Self {
            header_table_size: frame::DEFAULT_HEADER_TABLE_SIZE,
            enable_push: true,
            max_concurrent_streams: u32::MAX,
            initial_window_size: frame::DEFAULT_INITIAL_WINDOW_SIZE,
            max_frame_size: frame::DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: u32::MAX,
        }
    }
}

impl ConnectionSettings {
    /// The values this client advertises.
    pub fn local(config: &Http2Config) -> Self {
        Self {
            header_table_size: config.header_table_size,
            enable_push: config.enable_push,
            max_concurrent_streams: config.max_concurrent_streams,
            initial_window_size: config.initial_window_size.min(frame::MAX_WINDOW_SIZE),
            max_frame_size: config
                .max_frame_size
                .clamp(frame::DEFAULT_MAX_FRAME_SIZE, frame::MAX_FRAME_SIZE),
            max_header_list_size: u32::MAX,
        }
    }

    /// The SETTINGS frame announcing these values.
    pub fn to_frame(&self) -> SettingsFrame {
        let mut settings = vec![
            Setting {
                id: SettingId::HeaderTableSize,
                value: self.header_table_size,
            },
            Setting {
                id: SettingId::EnablePush,
                value: self.enable_push as u32,
            },
            Setting {
                id: SettingId::MaxConcurrentStreams,
                value: self.max_concurrent_streams,
            },
            Setting {
                id: SettingId::InitialWindowSize,
                value: self.initial_window_size,
            },
            Setting {
                id: SettingId::MaxFrameSize,
                value: self.max_frame_size,
            },
        ];
        if self.max_header_list_size != u32::MAX {
            settings.push(Setting {
                id: SettingId::MaxHeaderListSize,
                value: self.max_header_list_size,
            });
        }
        SettingsFrame {
            ack: false,
            settings,
        }
    }

    /// Apply a received SETTINGS frame. Values were range-checked by the
    /// decoder; unknown identifiers are ignored.
    ///
    /// Returns the change in the initial window size, which the caller
    /// applies to every open stream's send window.
    pub fn apply(&mut self, frame: &SettingsFrame) -> i64 {
        let before = self.initial_window_size as i64;
        for setting in &frame.settings {
            match setting.id {
                SettingId::HeaderTableSize => self.header_table_size = setting.value,
                SettingId::EnablePush => self.enable_push = setting.value == 1,
                SettingId::MaxConcurrentStreams => self.max_concurrent_streams = setting.value,
                SettingId::InitialWindowSize => self.initial_window_size = setting.value,
                SettingId::MaxFrameSize => self.max_frame_size = setting.value,
                SettingId::MaxHeaderListSize => self.max_header_list_size = setting.value,
                SettingId::Unknown(_) => {}
            }
        }
        self.initial_window_size as i64 - before
    }

    /// Token68 value for the `HTTP2-Settings` header of an HTTP/1.1
    /// `Upgrade: h2c` request: the SETTINGS payload in unpadded base64url.
    pub fn upgrade_payload(&self) -> String {
        let mut payload = Vec::new();
        for setting in &self.to_frame().settings {
            payload.extend_from_slice(&u16::from(setting.id).to_be_bytes());
            payload.extend_from_slice(&setting.value.to_be_bytes());
        }
        base64url_encode(&payload)
    }
}

/// Encode base64url (URL-safe alphabet, no padding).
fn base64url_encode(input: &[u8]) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

    let mut output = String::with_capacity(input.len().div_ceil(3) * 4);
    for chunk in input.chunks(3) {
        let b = [
            chunk[0],
            chunk.get(1).copied().unwrap_or(0),
            chunk.get(2).copied().unwrap_or(0),
        ];
        let n = (b[0] as u32) << 16 | (b[1] as u32) << 8 | b[2] as u32;
        let sextets = chunk.len() + 1;
        for i in 0..sextets {
            let index = (n >> (18 - 6 * i)) & 0x3f;
            output.push(ALPHABET[index as usize] as char);
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_defaults() {
        let settings = ConnectionSettings::default();
        assert_eq!(settings.initial_window_size, 65535);
        assert_eq!(settings.max_frame_size, 16384);
        assert_eq!(settings.header_table_size, 4096);
        assert!(settings.enable_push);
        assert_eq!(settings.max_concurrent_streams, u32::MAX);
    }

    #[test]
    fn test_local_from_config() {
        let config = Http2Config {
            max_frame_size: 1,
            ..Default::default()
        };
        let settings = ConnectionSettings::local(&config);
        assert!(!settings.enable_push);
        assert_eq!(settings.max_frame_size, 16384);
        assert_eq!(settings.initial_window_size, config.initial_window_size);
    }

    #[test]
    fn test_to_frame() {
        let frame = ConnectionSettings::local(&Http2Config::default()).to_frame();
        assert!(!frame.ack);
        assert_eq!(frame.get(SettingId::EnablePush), Some(0));
        assert_eq!(frame.get(SettingId::MaxFrameSize), Some(16384));
        assert_eq!(frame.get(SettingId::MaxHeaderListSize), None);
    }

    #[test]
    fn test_apply_returns_window_delta() {
        let mut settings = ConnectionSettings::default();
        let frame = SettingsFrame {
            ack: false,
            settings: vec![
                Setting {
                    id: SettingId::InitialWindowSize,
                    value: 0,
                },
                Setting {
                    id: SettingId::MaxConcurrentStreams,
                    value: 10,
                },
                Setting {
                    id: SettingId::Unknown(0x99),
                    value: 1,
                },
            ],
        };
        assert_eq!(settings.apply(&frame), -65535);
        assert_eq!(settings.max_concurrent_streams, 10);

        let frame = SettingsFrame {
            ack: false,
            settings: vec![Setting {
                id: SettingId::HeaderTableSize,
                value: 0,
            }],
        };
        assert_eq!(settings.apply(&frame), 0);
        assert_eq!(settings.header_table_size, 0);
    }

    #[test]
    fn test_base64url() {
        assert_eq!(base64url_encode(b""), "");
        assert_eq!(base64url_encode(b"a"), "YQ");
        assert_eq!(base64url_encode(b"ab"), "YWI");
        assert_eq!(base64url_encode(b"abc"), "YWJj");
        assert_eq!(base64url_encode(&[0xfb, 0xff]), "-_8");
    }

    #[test]
    fn test_upgrade_payload() {
        let settings = ConnectionSettings {
            header_table_size: 4096,
            enable_push: false,
            max_concurrent_streams: 100,
            initial_window_size: 65535,
            max_frame_size: 16384,
            max_header_list_size: u32::MAX,
        };
        // 00 01 00 00 10 00 | 00 02 00 00 00 00 | 00 03 00 00 00 64 |
        // 00 04 00 00 ff ff | 00 05 00 00 40 00
        assert_eq!(
            settings.upgrade_payload(),
            "AAEAABAAAAIAAAAAAAMAAABkAAQAAP__AAUAAEAA"
        );
    }
}
