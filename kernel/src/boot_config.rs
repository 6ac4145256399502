//! Boot command-line parsing.
//!
//! The command line is a single space-separated string of `key` or
//! `key=value` tokens. Recognised keys are folded into a [`BootConfig`];
//! anything else is logged as a warning and otherwise ignored.

use alloc::string::String;
use alloc::vec::Vec;

/// Terminal driver selected by the `term=` token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    /// VBE/VESA linear framebuffer.
    Vbe,
    /// The 16550 serial UART (the default).
    Serial,
}

/// Parsed boot command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootConfig {
    /// `smp={on|off}`. Defaults to `on`.
    pub smp: bool,
    /// `term={vbe|serial}`. Defaults to [`Terminal::Serial`].
    pub terminal: Terminal,
    /// `tests=a,b,c`. Empty when the token is absent.
    pub tests: Vec<String>,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            smp: true,
            terminal: Terminal::Serial,
            tests: Vec::new(),
        }
    }
}

impl BootConfig {
    /// Tokenise `cmdline` on ASCII whitespace and fold recognised `key` /
    /// `key=value` tokens into a [`BootConfig`]. Unrecognised tokens are
    /// logged as a warning and otherwise ignored.
    pub fn parse(cmdline: &str) -> Self {
        let mut config = Self::default();
        for token in cmdline.split_ascii_whitespace() {
            match token.split_once('=') {
                Some(("smp", value)) => match value {
                    "on" => config.smp = true,
                    "off" => config.smp = false,
                    _ => log::warn!("boot cmdline: ignoring unrecognised smp value '{value}'"),
                },
                Some(("term", value)) => match value {
                    "vbe" => config.terminal = Terminal::Vbe,
                    "serial" => config.terminal = Terminal::Serial,
                    _ => log::warn!("boot cmdline: ignoring unrecognised term value '{value}'"),
                },
                Some(("tests", value)) => {
                    config.tests = value.split(',').filter(|s| !s.is_empty()).map(String::from).collect();
                }
                Some((key, _)) => log::warn!("boot cmdline: ignoring unrecognised key '{key}'"),
                None if token.is_empty() => {}
                None => log::warn!("boot cmdline: ignoring unrecognised token '{token}'"),
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_cmdline_yields_defaults() {
        let config = BootConfig::parse("");
        assert_eq!(config, BootConfig::default());
    }

    #[test]
    fn recognised_keys_are_parsed() {
        let config = BootConfig::parse("smp=off term=vbe tests=pmm,vmm,handle");
        assert!(!config.smp);
        assert_eq!(config.terminal, Terminal::Vbe);
        assert_eq!(config.tests, alloc::vec![String::from("pmm"), String::from("vmm"), String::from("handle")]);
    }

    #[test]
    fn whitespace_is_insignificant() {
        let config = BootConfig::parse("   smp=on    term=serial  ");
        assert!(config.smp);
        assert_eq!(config.terminal, Terminal::Serial);
    }

    #[test]
    fn unrecognised_tokens_are_ignored_not_fatal() {
        let config = BootConfig::parse("quiet smp=on nosuchkey=123 splash");
        assert!(config.smp);
        assert_eq!(config.terminal, Terminal::Serial);
    }

    #[test]
    fn bare_flag_with_no_equals_is_unrecognised() {
        let config = BootConfig::parse("smp");
        assert_eq!(config, BootConfig::default());
    }
}
