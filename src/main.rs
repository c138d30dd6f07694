/* SPDX-License-Identifier: GPL-3.0-or-later */
use clap::{Arg, ArgAction, Command, value_parser};
use log::{Log, Record, debug, error};
use std::ffi::OsString;
use std::io::Read;
use std::io::Write;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::process::ExitCode;

mod compress;
mod conn;
mod damage;
mod kernel;
mod mirror;
mod pool;
mod reconnect;
mod server;
mod shadow;
mod test;
mod token;
mod transfer;
mod util;

use crate::util::*;

/** Logger configuration data */
struct Logger {
    max_level: log::LevelFilter,
    pid: u32,
    color_output: bool,
    color: usize,
    label: &'static str,
}

impl Log for Logger {
    fn enabled(&self, meta: &log::Metadata<'_>) -> bool {
        meta.level() <= self.max_level
    }
    fn log(&self, record: &Record<'_>) {
        if record.level() > self.max_level {
            return;
        }

        let time = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH);
        let t = if let Ok(t) = time {
            (t.as_nanos() % 100000000000u128) / 1000u128
        } else {
            0
        };
        let (esc1a, esc1b, esc1c) = if self.color_output {
            let c = if self.color == 0 {
                "36"
            } else if self.color == 1 {
                "34"
            } else {
                "35"
            };
            if record.level() <= log::Level::Error {
                ("\x1b[0;", c, ";1m")
            } else {
                ("\x1b[0;", c, "m")
            }
        } else {
            ("", "", "")
        };
        let esc2 = if self.color_output { "\x1b[0m" } else { "" };
        let lvl_str: &str = match record.level() {
            log::Level::Error => "ERR",
            log::Level::Warn => "Wrn",
            log::Level::Debug => "dbg",
            log::Level::Info => "inf",
            log::Level::Trace => "trc",
        };

        const MAX_LOG_LEN: usize = 512;
        let mut buf = [0u8; MAX_LOG_LEN];
        let mut cursor = std::io::Cursor::new(&mut buf[..MAX_LOG_LEN - 5]);
        let _ = write!(
            &mut cursor,
            "{}{}{}[{:02}.{:06} {} {}({}) {}:{}]{} {}\n",
            esc1a,
            esc1b,
            esc1c,
            t / 1000000u128,
            t % 1000000u128,
            lvl_str,
            self.label,
            self.pid,
            {
                let f = record.file().unwrap_or("unknown");
                f.strip_prefix("src/").unwrap_or(f)
            },
            record.line().unwrap_or(0),
            esc2,
            record.args(),
        );
        let mut str_end = cursor.position() as usize;
        if str_end >= MAX_LOG_LEN - 9 {
            /* Deal with possible partial UTF-8 char */
            str_end = match std::str::from_utf8(&buf[..str_end]) {
                Ok(x) => x.len(),
                Err(y) => y.valid_up_to(),
            };
        }
        if str_end >= MAX_LOG_LEN - 9 {
            /* Assume message was truncated */
            buf[str_end..str_end + 3].fill(b'.');
            buf[str_end + 3] = b'\n';
            str_end += 4;
        }
        let handle = &mut std::io::stderr().lock();
        let _ = handle.write_all(&buf[..str_end]);
        let _ = handle.flush();
    }
    fn flush(&self) {
        /* not needed */
    }
}

/** Capture an inherited file descriptor whose number was passed through the
 * named environment variable. */
fn fd_from_env(var: &str) -> Result<Option<OwnedFd>, String> {
    let Some(value) = std::env::var_os(var) else {
        return Ok(None);
    };
    let num = value
        .into_string()
        .ok()
        .and_then(|x| x.parse::<i32>().ok())
        .ok_or_else(|| tag!("Failed to parse fd number in {}", var))?;
    let fd = unsafe {
        // SAFETY: relies on the spawning supervisor's promise that the
        // number is an inherited fd; this is the only place `var` is read
        OwnedFd::from_raw_fd(RawFd::from(num))
    };
    set_cloexec(&fd, true)?;
    Ok(Some(fd))
}

fn main() -> ExitCode {
    let command = Command::new(env!("CARGO_PKG_NAME"))
        .disable_help_subcommand(true)
        .subcommand_required(true)
        .help_expected(true)
        .subcommand_help_heading("Modes")
        .subcommand_value_name("MODE")
        .about(
            "Forward Wayland protocol applications over a byte-stream channel\n\
            See `man 1 waybridge` for detailed help.",
        )
        .version(env!("CARGO_PKG_VERSION"));
    let command = command
        .subcommand(
            Command::new("server")
                .about(
                    "Run a process and forward its application data through a socket\n\
                    to the matching display-side instance",
                )
                .disable_help_flag(true)
                // collect all following arguments as the command
                .arg(
                    Arg::new("command")
                        .num_args(0..)
                        .trailing_var_arg(true)
                        .allow_hyphen_values(true)
                        .help("Command to execute"),
                ),
        )
        .subcommand(Command::new("conn").disable_help_flag(true).hide(true))
        .subcommand(
            Command::new("reconnect-helper")
                .disable_help_flag(true)
                .hide(true),
        );
    let command = command
        .arg(
            Arg::new("compress")
                .short('c')
                .long("compress")
                .value_name("comp")
                .help("Choose compression method: lz4[=#], zstd[=#], none")
                .value_parser(value_parser!(Compression))
                .default_value("none"),
        )
        .arg(
            Arg::new("control")
                .long("control")
                .value_name("path")
                .help("Create a control FIFO at this path, making the session reconnectable")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("debug")
                .short('d')
                .long("debug")
                .help("Print debug messages")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("display")
                .long("display")
                .value_name("display")
                .help("Set the Wayland display name or path")
                .value_parser(value_parser!(OsString)),
        )
        .arg(
            Arg::new("drm-node")
                .long("drm-node")
                .value_name("path")
                .help("Set preferred DRM node")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("login-shell")
                .long("login-shell")
                .help("If the server command is empty, run a login shell")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("no-gpu")
                .short('n')
                .long("no-gpu")
                .help("Block protocols using GPU memory transfers (via DMABUFs)")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("oneshot")
                .short('o')
                .long("oneshot")
                .help("Only permit one connected application")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("socket")
                .short('s')
                .long("socket")
                .value_name("path")
                .help("Set the channel socket path to connect to")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("threads")
                .long("threads")
                .help("Number of worker threads to use: 0 => hardware threads/2")
                .value_parser(value_parser!(u32))
                .default_value("0"),
        )
        .arg(
            Arg::new("unlink-socket")
                .long("unlink-socket")
                .help("Unlink the socket that the server connects to")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("video")
                .long("video")
                .value_name("options")
                .help("Video-encode DMABUFs when possible: none, vaapi, sw")
                .default_value("none")
                .value_parser(value_parser!(Video)),
        );
    let matches = command.get_matches();

    let debug_flag = *matches.get_one::<bool>("debug").unwrap();
    let max_level = if debug_flag {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Error
    };
    let (log_color, log_label) = match matches.subcommand() {
        Some(("server", _)) => (2, "waybridge-server"),
        Some(("conn", _)) => (1, "waybridge-conn"),
        Some(("reconnect-helper", _)) => (0, "waybridge-reco"),
        _ => (0, "waybridge"),
    };
    let logger = Logger {
        max_level,
        pid: std::process::id(),
        color_output: nix::unistd::isatty(2).unwrap_or(false),
        color: log_color,
        label: log_label,
    };
    log::set_max_level(max_level);
    log::set_boxed_logger(Box::new(logger)).unwrap();

    let opts = Options {
        debug: debug_flag,
        compression: *matches.get_one::<Compression>("compress").unwrap(),
        video: *matches.get_one::<Video>("video").unwrap(),
        threads: *matches.get_one::<u32>("threads").unwrap(),
        no_gpu: *matches.get_one::<bool>("no-gpu").unwrap(),
        dmabuf_device: matches.get_one::<PathBuf>("drm-node").cloned(),
    };

    let result: Result<i32, String> = match matches.subcommand() {
        Some(("server", submatch)) => {
            debug!("Starting server supervisor");
            let command: Vec<OsString> = submatch
                .get_raw("command")
                .map(|vals| vals.map(OsString::from).collect())
                .unwrap_or_default();
            let display = matches
                .get_one::<OsString>("display")
                .cloned()
                .unwrap_or_else(|| {
                    let mut w = OsString::from("wayland-");
                    w.push(format!("{}", std::process::id()));
                    w
                });
            let cfg = server::ServerConfig {
                socket_path: matches
                    .get_one::<PathBuf>("socket")
                    .cloned()
                    .unwrap_or_else(|| PathBuf::from("/tmp/waybridge-server.sock")),
                wayland_display: display,
                control_path: matches.get_one::<PathBuf>("control").cloned(),
                oneshot: *matches.get_one::<bool>("oneshot").unwrap(),
                unlink_at_end: *matches.get_one::<bool>("unlink-socket").unwrap(),
                login_shell: *matches.get_one::<bool>("login-shell").unwrap(),
                command,
            };
            server::run_server(&cfg, &opts)
        }
        Some(("conn", _)) => {
            debug!("Starting connection worker process");
            (|| {
                let chan_fd = fd_from_env("WAYBRIDGE_CHAN_FD")?
                    .ok_or_else(|| tag!("Channel fd not provided for conn mode"))?;
                let app_fd = fd_from_env("WAYBRIDGE_APP_FD")?
                    .ok_or_else(|| tag!("Application fd not provided for conn mode"))?;
                let link_fd = fd_from_env("WAYBRIDGE_LINK_FD")?;
                let pollmask = setup_shutdown_handler()?;
                conn::main_interface_loop(chan_fd, app_fd, link_fd, &opts, false, pollmask)
                    .map(|()| 0)
            })()
        }
        Some(("reconnect-helper", _)) => {
            debug!("Starting reconnection helper process");
            (|| {
                let control_fd = fd_from_env("WAYBRIDGE_CONTROL_FD")?
                    .ok_or_else(|| tag!("Control fd not provided for helper mode"))?;
                let link_fd = fd_from_env("WAYBRIDGE_LINK_FD")?
                    .ok_or_else(|| tag!("Link fd not provided for helper mode"))?;
                let mut token_bytes = [0_u8; 16];
                std::io::stdin()
                    .read_exact(&mut token_bytes)
                    .map_err(|x| tag!("Failed to read token from stdin: {}", x))?;
                let token = token::ConnectionToken::from_bytes(&token_bytes)?;
                let _ = setup_shutdown_handler()?;
                reconnect::run_reconnect_helper(control_fd, link_fd, &token).map(|()| 0)
            })()
        }
        _ => unreachable!(),
    };

    match result {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
