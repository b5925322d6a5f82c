use std::fs::File;
use std::io;
use std::io::BufRead;
use std::io::BufReader;
use std::str::FromStr;

use super::constants;

/// `Cfg` struct containing the config file information, previusly created with `Cfg::new`.
///
/// - `max_peers`: maximum number of simultaneous peer connections,
/// - `listen_port_start`: first port to try for the listening socket,
/// - `listen_port_end`: last port to try for the listening socket,
/// - `blacklist_file`: optional path to a file with one `ip:port` per line to ban at startup,
#[derive(Debug, Clone)]
pub struct Cfg {
    pub max_peers: u32,
    pub listen_port_start: u16,
    pub listen_port_end: u16,
    pub blacklist_file: Option<String>,
}

impl Cfg {
    /// Builds a Cfg struct containing the config file information by the given path.
    /// The format of the config file must be: {config_name}={config_value} (without brackets).
    /// In case of success it returns a Cfg struct.
    ///
    /// It returns an io::Error if:
    /// - The path to the config file does not exist or could not be open/readed.
    /// - The confing file has wrong format.
    /// - A wrong config_name was in the config file.
    /// - max_peers setting is not a valid number in the config file.
    /// - listen_port_start / listen_port_end settings are not valid port numbers.
    /// - The port range is empty (start greater than end).
    /// - Minimum number of correct settings were not reached.
    pub fn new(path: &str) -> io::Result<Self> {
        let mut cfg = Self {
            max_peers: 0,
            listen_port_start: 0,
            listen_port_end: 0,
            blacklist_file: None,
        };

        let file = File::open(path)?;
        let reader = BufReader::new(file);

        let mut settings_loaded = 0;

        for line in reader.lines() {
            let current_line = line?;
            let setting: Vec<&str> = current_line.split('=').collect();

            if setting.len() != 2 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("Invalid config input: {}", current_line),
                ));
            }
            cfg = Self::load_setting(cfg, setting[0], setting[1])?;
            settings_loaded += 1;
        }
        if settings_loaded < constants::MIN_SETTINGS {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "Minimum number of correct settings were not reached: {}",
                    settings_loaded
                ),
            ));
        }
        if cfg.listen_port_start > cfg.listen_port_end {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "Empty listen port range: {}-{}",
                    cfg.listen_port_start, cfg.listen_port_end
                ),
            ));
        }
        Ok(cfg)
    }

    fn load_setting(mut self, name: &str, value: &str) -> io::Result<Self> {
        match name {
            constants::MAX_PEERS => {
                self.max_peers = self.parse_value(value, constants::MAX_PEERS)?;
            }

            constants::LISTEN_PORT_START => {
                self.listen_port_start = self.parse_value(value, constants::LISTEN_PORT_START)?;
            }

            constants::LISTEN_PORT_END => {
                self.listen_port_end = self.parse_value(value, constants::LISTEN_PORT_END)?;
            }

            constants::BLACKLIST_FILE => self.blacklist_file = Some(String::from(value)),

            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("Invalid config setting name: {}", name),
                ))
            }
        }
        Ok(self)
    }

    fn parse_value<F>(&self, value: &str, setting: &str) -> io::Result<F>
    where
        F: FromStr,
    {
        let parse = value.parse::<F>();
        match parse {
            Err(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "Invalid setting: {}, is not a valid type: {}",
                    setting, value
                ),
            )),
            Ok(parse) => Ok(parse),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, io::Write};

    #[test]
    fn test_good_config() {
        let path = "./test_good_cfg.cfg";
        let contents = b"MAX_PEERS=35\nLISTEN_PORT_START=6881\nLISTEN_PORT_END=6889";
        create_and_write_file(path, contents);

        create_and_assert_config_is_ok(path, 35, 6881, 6889, None);
    }

    #[test]
    fn test_config_with_blacklist() {
        let path = "./test_cfg_with_blacklist.cfg";
        let contents =
            b"MAX_PEERS=10\nLISTEN_PORT_START=6881\nLISTEN_PORT_END=6881\nBLACKLIST_FILE=./bans.txt";
        create_and_write_file(path, contents);

        create_and_assert_config_is_ok(path, 10, 6881, 6881, Some("./bans.txt".to_string()));
    }

    #[test]
    fn test_bad_path() {
        let path = "bad path";
        let config = Cfg::new(path);
        assert!(config.is_err());
    }

    #[test]
    fn test_empty_file() {
        let path = "./test_empty_cfg.cfg";
        let contents = b"";
        create_and_write_file(path, contents);

        create_and_assert_config_is_not_ok(path);
    }

    #[test]
    fn test_setting_doesnt_exist() {
        let path = "./test_cfg_setting_doesnt_exist.cfg";
        let contents = b"WRONG_SETTING=1000";
        create_and_write_file(path, contents);

        create_and_assert_config_is_not_ok(path);
    }

    #[test]
    fn test_bad_number_of_settings() {
        let path = "./test_cfg_bad_number_of_settings.cfg";
        let contents = b"MAX_PEERS=35\nLISTEN_PORT_START=6881";
        create_and_write_file(path, contents);

        create_and_assert_config_is_not_ok(path);
    }

    #[test]
    fn test_max_peers_not_a_number() {
        let path = "./test_cfg_max_peers_not_a_number.cfg";
        let contents = b"MAX_PEERS=un_millon\nLISTEN_PORT_START=6881\nLISTEN_PORT_END=6889";
        create_and_write_file(path, contents);

        create_and_assert_config_is_not_ok(path);
    }

    #[test]
    fn test_port_not_a_number() {
        let path = "./test_cfg_port_not_a_number.cfg";
        let contents = b"MAX_PEERS=35\nLISTEN_PORT_START=abcd\nLISTEN_PORT_END=6889";
        create_and_write_file(path, contents);

        create_and_assert_config_is_not_ok(path);
    }

    #[test]
    fn test_empty_port_range() {
        let path = "./test_cfg_empty_port_range.cfg";
        let contents = b"MAX_PEERS=35\nLISTEN_PORT_START=6889\nLISTEN_PORT_END=6881";
        create_and_write_file(path, contents);

        create_and_assert_config_is_not_ok(path);
    }

    #[test]
    fn test_order_doesnt_matter() {
        let path = "./test_cfg_order_doesnt_matter.cfg";
        let contents = b"LISTEN_PORT_END=6885\nMAX_PEERS=5\nLISTEN_PORT_START=6882";
        create_and_write_file(path, contents);

        create_and_assert_config_is_ok(path, 5, 6882, 6885, None);
    }

    #[test]
    fn test_bad_format() {
        let path = "./test_cfg_bad_format.cfg";
        let contents = b"MAX_PEERS=abcd=1234\nLISTEN_PORT_START=6881\nLISTEN_PORT_END=6889";
        create_and_write_file(path, contents);

        create_and_assert_config_is_not_ok(path);
    }

    // Auxiliary functions

    fn create_and_write_file(path: &str, contents: &[u8]) {
        let mut file =
            File::create(path).unwrap_or_else(|_| panic!("Error creating file in path: {}", path));
        file.write_all(contents)
            .unwrap_or_else(|_| panic!("Error writing file in path: {}", path));
    }

    fn create_and_assert_config_is_ok(
        path: &str,
        max_peers: u32,
        listen_port_start: u16,
        listen_port_end: u16,
        blacklist_file: Option<String>,
    ) {
        let config = Cfg::new(path);

        assert!(config.is_ok());

        let config = config.unwrap_or_else(|_| panic!("Error creating config in path: {}", path));

        assert_eq!(config.max_peers, max_peers);
        assert_eq!(config.listen_port_start, listen_port_start);
        assert_eq!(config.listen_port_end, listen_port_end);
        assert_eq!(config.blacklist_file, blacklist_file);

        fs::remove_file(path).unwrap_or_else(|_| panic!("Error removing file in path: {}", path));
    }

    fn create_and_assert_config_is_not_ok(path: &str) {
        let config = Cfg::new(path);
        assert!(config.is_err());
        fs::remove_file(path).unwrap_or_else(|_| panic!("Error removing file in path: {}", path));
    }
}
