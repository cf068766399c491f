//! Command-line surface, mirroring `main.c`'s `getopt` table one-to-one.

use clap::Parser;

use crate::uuid::Uuid;

fn parse_num_vfs(s: &str) -> Result<u8, String> {
    let n: u32 = s.parse().map_err(|_| format!("not a number: {s}"))?;
    match n {
        2 | 4 | 8 | 16 => Ok(n as u8),
        _ => Err(format!("num-vfs must be one of 2, 4, 8, 16 (got {n})")),
    }
}

fn parse_log_level(s: &str) -> Result<i32, String> {
    let n: i32 = s.parse().map_err(|_| format!("not a number: {s}"))?;
    if !(0..=7).contains(&n) {
        return Err(format!("log level must be 0..7 (got {n})"));
    }
    Ok(n)
}

fn parse_eng_sel(s: &str) -> Result<u32, String> {
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(s, 16).map_err(|_| format!("not a hex number: {s}"))
}

fn parse_uuid(s: &str) -> Result<Uuid, String> {
    Uuid::parse(s).ok_or_else(|| format!("not a canonical uuid: {s}"))
}

#[derive(Debug, Parser)]
#[command(name = "odm_pf", about = "Marvell ODM PF controller")]
pub struct Cli {
    /// Enable duplicate logging to standard error.
    #[arg(short = 'c', long = "console")]
    pub console_logging: bool,

    /// Log-level upper bound, 0..7 (syslog priorities).
    #[arg(short = 'l', long = "log-level", value_parser = parse_log_level, default_value = "6")]
    pub log_level: i32,

    /// Run the self-test sequence and exit.
    #[arg(short = 's', long = "self-test")]
    pub self_test: bool,

    /// 32-bit engine-to-queue selector.
    #[arg(short = 'e', long = "eng-sel", value_parser = parse_eng_sel, default_value = "0xAAAAAAAA")]
    pub eng_sel: u32,

    /// Initial desired VF count.
    #[arg(long = "num-vfs", value_parser = parse_num_vfs, default_value = "4")]
    pub num_vfs: u8,

    /// Canonical 36-char UUID for PF/VF token sharing.
    #[arg(long = "vfio-vf-token", value_parser = parse_uuid)]
    pub vfio_vf_token: Option<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_num_vfs() {
        for v in ["2", "4", "8", "16"] {
            assert!(parse_num_vfs(v).is_ok());
        }
    }

    #[test]
    fn rejects_non_power_of_two_num_vfs() {
        assert!(parse_num_vfs("3").is_err());
        assert!(parse_num_vfs("32").is_err());
    }

    #[test]
    fn rejects_out_of_range_log_level() {
        assert!(parse_log_level("8").is_err());
        assert!(parse_log_level("-1").is_err());
    }

    #[test]
    fn eng_sel_accepts_0x_prefix() {
        assert_eq!(parse_eng_sel("0xAAAAAAAA").unwrap(), 0xAAAAAAAA);
        assert_eq!(parse_eng_sel("AAAAAAAA").unwrap(), 0xAAAAAAAA);
    }
}
