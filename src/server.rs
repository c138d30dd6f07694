/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! The session supervisor: runs the application, accepts its connections,
 * and keeps reconnectable sessions migratable */
use crate::conn::main_interface_loop;
use crate::reconnect::{dial_unix, read_socket_path, send_one_fd};
use crate::tag;
use crate::token::{ConnectionToken, TokenMinter};
use crate::util::*;
use log::{debug, error};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags};
use nix::sys::{signal, socket, stat, wait};
use nix::{fcntl, unistd};
use std::ffi::{OsStr, OsString};
use std::io::Write;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

/** Inputs for [run_server] */
pub struct ServerConfig {
    /** Channel socket to dial for each connection */
    pub socket_path: PathBuf,
    /** Display socket name; absolute, or relative to `$XDG_RUNTIME_DIR` */
    pub wayland_display: OsString,
    /** If set, create a control FIFO here and support migration/reconnect */
    pub control_path: Option<PathBuf>,
    pub oneshot: bool,
    /** Unlink the channel socket after connecting to it */
    pub unlink_at_end: bool,
    /** If the command is empty and this is set, run `$SHELL` as a login shell */
    pub login_shell: bool,
    /** Application argv; empty means "run a shell" */
    pub command: Vec<OsString>,
}

/** One live connection; the token and link are kept only for
 * reconnectable sessions */
struct ConnRow {
    token: ConnectionToken,
    child: Child,
    link_fd: Option<OwnedFd>,
}

/** Get the filesystem path of this executable (via /proc/self/exe) */
fn get_self_path() -> Result<OsString, String> {
    fcntl::readlink("/proc/self/exe").map_err(|x| {
        tag!(
            "Failed to look up path of own executable (/proc/self/exe): {}",
            x
        )
    })
}

/** Compute the full display socket path per the WAYLAND_DISPLAY convention */
fn display_socket_path(wayland_display: &OsStr) -> Result<PathBuf, String> {
    let path = if wayland_display.as_encoded_bytes().starts_with(b"/") {
        PathBuf::from(wayland_display)
    } else {
        let runtime_dir = std::env::var_os("XDG_RUNTIME_DIR")
            .ok_or_else(|| tag!("Environment variable XDG_RUNTIME_DIR not present"))?;
        PathBuf::from(runtime_dir).join(wayland_display)
    };
    if path.as_os_str().as_encoded_bytes().len() >= SUN_PATH_MAX {
        return Err(tag!(
            "Display socket name too long: {:?} has {} bytes, limit {}",
            path,
            path.as_os_str().as_encoded_bytes().len(),
            SUN_PATH_MAX - 1
        ));
    }
    Ok(path)
}

/** The shell and argv0 used when no command was given */
fn backup_shell_command(login_shell: bool) -> (OsString, OsString) {
    let shell = std::env::var_os("SHELL").unwrap_or_else(|| OsString::from("/bin/sh"));
    let argv0 = if login_shell {
        /* The convention for a login shell is an argv0 of "-<shell name>" */
        let bt = shell.as_bytes();
        let base = match bt.iter().rposition(|x| *x == b'/') {
            Some(idx) => &bt[idx + 1..],
            None => bt,
        };
        let mut a = OsString::from("-");
        a.push(OsStr::from_bytes(base));
        a
    } else {
        shell.clone()
    };
    (shell, argv0)
}

/** Launch the application process with the appropriate display environment */
fn spawn_application(
    cfg: &ServerConfig,
    wayland_socket: Option<&OwnedFd>,
) -> Result<Child, String> {
    let (shell, shell_argv0) = backup_shell_command(cfg.login_shell);
    let (program, argv0, args): (&OsStr, &OsStr, &[OsString]) = if cfg.command.is_empty() {
        (&shell, &shell_argv0, &[])
    } else {
        (&cfg.command[0], &cfg.command[0], &cfg.command[1..])
    };

    let mut cmd = Command::new(program);
    cmd.arg0(argv0).args(args);
    if let Some(sock) = wayland_socket {
        set_cloexec(sock, false)?;
        cmd.env("WAYLAND_SOCKET", format!("{}", sock.as_raw_fd()))
            .env_remove("WAYLAND_DISPLAY");
    } else {
        cmd.env("WAYLAND_DISPLAY", &cfg.wayland_display)
            .env_remove("WAYLAND_SOCKET");
    }
    cmd.spawn()
        .map_err(|x| tag!("Failed to run program {:?}: {}", program, x))
}

/** Create the control FIFO and open it.
 *
 * Both ends are opened, so an emptied writer side does not produce POLLHUP
 * storms in the poll loop. */
pub(crate) fn open_control_pipe(control_path: &Path) -> Result<OwnedFd, String> {
    unistd::mkfifo(control_path, stat::Mode::from_bits_truncate(0o644))
        .map_err(|x| tag!("Failed to make control FIFO at {:?}: {}", control_path, x))?;
    let raw = fcntl::open(
        control_path,
        fcntl::OFlag::O_RDWR | fcntl::OFlag::O_NONBLOCK | fcntl::OFlag::O_CLOEXEC,
        stat::Mode::empty(),
    )
    .map_err(|x| tag!("Failed to open control FIFO at {:?}: {}", control_path, x))?;
    Ok(unsafe {
        // SAFETY: freshly opened, exclusively owned
        OwnedFd::from_raw_fd(raw)
    })
}

/** Dial the channel socket; optionally unlink the path once connected */
fn connect_channel(socket_path: &Path, unlink_after: bool) -> Result<OwnedFd, String> {
    let fd = dial_unix(socket_path)?;
    if unlink_after {
        /* Only unlink what actually was a connectable socket */
        if let Err(e) = unistd::unlink(socket_path) {
            error!("Failed to unlink socket {:?}: {}", socket_path, e);
        }
    }
    Ok(fd)
}

/** Spawn the reconnection helper process. The token travels over the
 * child's stdin; the FIFO and link fds are inherited by number. */
fn spawn_reconnect_helper(
    self_path: &OsStr,
    control_pipe: OwnedFd,
    link_fd: OwnedFd,
    token: &ConnectionToken,
    opts: &Options,
) -> Result<Child, String> {
    set_cloexec(&control_pipe, false)?;
    set_cloexec(&link_fd, false)?;
    let mut cmd = Command::new(self_path);
    cmd.arg0(env!("CARGO_PKG_NAME"));
    if opts.debug {
        cmd.arg("--debug");
    }
    cmd.arg("reconnect-helper")
        .env(
            "WAYBRIDGE_CONTROL_FD",
            format!("{}", control_pipe.as_raw_fd()),
        )
        .env("WAYBRIDGE_LINK_FD", format!("{}", link_fd.as_raw_fd()))
        .stdin(Stdio::piped());
    let mut child = cmd
        .spawn()
        .map_err(|x| tag!("Failed to spawn reconnection helper: {}", x))?;
    let mut stdin = child.stdin.take().unwrap();
    stdin
        .write_all(&token.to_bytes())
        .map_err(|x| tag!("Failed to send token to reconnection helper: {}", x))?;
    drop(stdin);
    /* The supervisor's copies are no longer needed */
    drop(control_pipe);
    drop(link_fd);
    Ok(child)
}

/** Spawn a connection worker process for one accepted application socket */
fn spawn_connection_worker(
    self_path: &OsStr,
    chan_fd: OwnedFd,
    app_fd: OwnedFd,
    link_fd: Option<OwnedFd>,
    opts: &Options,
) -> Result<Child, String> {
    set_cloexec(&chan_fd, false)?;
    set_cloexec(&app_fd, false)?;
    let mut cmd = Command::new(self_path);
    cmd.arg0(env!("CARGO_PKG_NAME"));
    if opts.debug {
        cmd.arg("--debug");
    }
    if opts.no_gpu {
        cmd.arg("--no-gpu");
    }
    cmd.arg("--compress")
        .arg(opts.compression.to_string())
        .arg("--threads")
        .arg(opts.threads.to_string())
        .arg("--video")
        .arg(opts.video.to_string());
    if let Some(d) = &opts.dmabuf_device {
        cmd.arg("--drm-node").arg(d);
    }
    cmd.arg("conn")
        .env("WAYBRIDGE_CHAN_FD", format!("{}", chan_fd.as_raw_fd()))
        .env("WAYBRIDGE_APP_FD", format!("{}", app_fd.as_raw_fd()))
        .env_remove("WAYBRIDGE_LINK_FD")
        .env_remove("WAYLAND_SOCKET");
    if let Some(ref link) = link_fd {
        set_cloexec(link, false)?;
        cmd.env("WAYBRIDGE_LINK_FD", format!("{}", link.as_raw_fd()));
    }
    let child = cmd
        .spawn()
        .map_err(|x| tag!("Failed to spawn connection worker: {}", x))?;
    /* This process no longer needs its copies */
    drop(chan_fd);
    drop(app_fd);
    drop(link_fd);
    Ok(child)
}

/** Block SIGCHLD outside ppoll and give it a no-op handler, so child exits
 * interrupt the poll but nothing else. Must run before the loop, after the
 * application has been spawned. */
fn setup_sigchld(pollmask: &mut signal::SigSet) -> Result<(), String> {
    let mut mask = signal::SigSet::empty();
    mask.add(signal::SIGCHLD);
    let prev = mask
        .thread_swap_mask(signal::SigmaskHow::SIG_BLOCK)
        .map_err(|x| tag!("Failed to set sigmask: {}", x))?;
    *pollmask = prev;
    pollmask.remove(signal::SIGCHLD);
    pollmask.remove(signal::Signal::SIGINT);
    pollmask.remove(signal::Signal::SIGTERM);

    extern "C" fn noop_handler(_: i32) {}
    let sigaction = signal::SigAction::new(
        signal::SigHandler::Handler(noop_handler),
        signal::SaFlags::SA_NOCLDSTOP,
        signal::SigSet::empty(),
    );
    unsafe {
        // SAFETY: handler is trivial and async-signal-safe
        signal::sigaction(signal::Signal::SIGCHLD, &sigaction)
            .map_err(|x| tag!("Failed to set sigaction: {}", x))?;
    }
    Ok(())
}

/** Wait for the application and map its status to the supervisor's exit code */
fn wait_application(child: &mut Child) -> i32 {
    debug!("Waiting for application {} to reveal status", child.id());
    if shutdown_requested() {
        match child.try_wait() {
            Ok(Some(status)) => status.code().unwrap_or(1),
            _ => 0,
        }
    } else {
        match child.wait() {
            Ok(status) => status.code().unwrap_or(1),
            Err(_) => 1,
        }
    }
}

/** Oneshot runner: one application, one channel connection, no accept loop.
 * The worker loop runs in this process. */
fn run_oneshot(
    cfg: &ServerConfig,
    opts: &Options,
    control_pipe: Option<OwnedFd>,
    worker_app_fd: OwnedFd,
    minter: &mut TokenMinter,
    pollmask: signal::SigSet,
) -> Result<(), String> {
    let chanfd = connect_channel(&cfg.socket_path, cfg.unlink_at_end)?;

    let reconnectable = control_pipe.is_some();
    let token = minter.mint(reconnectable, false)?;
    debug!("Connection token header: {:08x}", token.header);
    write_all(&chanfd, &token.to_bytes())
        .map_err(|x| tag!("Failed to write connection token: {}", x))?;

    let mut helper: Option<Child> = None;
    let mut worker_link: Option<OwnedFd> = None;
    if let Some(control) = control_pipe {
        let (link_worker, link_helper) = socket::socketpair(
            socket::AddressFamily::Unix,
            socket::SockType::Stream,
            None,
            socket::SockFlag::SOCK_CLOEXEC,
        )
        .map_err(|x| tag!("Failed to create socketpair: {}", x))?;
        let self_path = get_self_path()?;
        helper = Some(spawn_reconnect_helper(
            &self_path,
            control,
            link_helper,
            &token,
            opts,
        )?);
        worker_link = Some(link_worker);
    }

    let ret = main_interface_loop(chanfd, worker_app_fd, worker_link, opts, false, pollmask);

    if let Some(mut h) = helper {
        /* Our link end is closed by now; the helper exits on the hangup */
        debug!("Waiting for reconnection helper {}", h.id());
        let _ = h.wait();
    }
    ret
}

/** Migrate every live connection to a newly announced channel address.
 *
 * Stops at the first failing row: rows already moved stay on the new
 * address, the rest keep the old one, and the supervisor retains the old
 * address for future connections. On full success the new address is
 * adopted and the previous socket unlinked if owned. */
pub(crate) fn update_connections(
    current_addr: &mut PathBuf,
    new_addr: &Path,
    rows: &[(ConnectionToken, &OwnedFd)],
    unlink_at_end: bool,
) -> Result<(), String> {
    for (i, (token, link_fd)) in rows.iter().enumerate() {
        let chanfd = dial_unix(new_addr)
            .map_err(|x| tag!("Migration stopped at connection {}: {}", i, x))?;
        let flagged = token.flag_update();
        write_all(&chanfd, &flagged.to_bytes()).map_err(|x| {
            tag!(
                "Migration stopped at connection {}: failed to write token: {}",
                i,
                x
            )
        })?;
        send_one_fd(link_fd, chanfd.as_raw_fd()).map_err(|x| {
            tag!(
                "Migration stopped at connection {}: failed to pass fd: {}",
                i,
                x
            )
        })?;
        /* drop(chanfd) closes the supervisor's copy */
    }
    if unlink_at_end && current_addr.as_path() != new_addr {
        if let Err(e) = unistd::unlink(current_addr.as_path()) {
            error!("Failed to unlink old socket {:?}: {}", current_addr, e);
        }
    }
    *current_addr = PathBuf::from(new_addr);
    debug!("Adopted new channel address {:?}", current_addr);
    Ok(())
}

enum ReapOutcome {
    Continue,
    AppExited(i32),
}

/** Reap any exited children without blocking */
fn reap_children(app: &mut Child, rows: &mut Vec<ConnRow>) -> Result<ReapOutcome, String> {
    loop {
        let res = wait::waitid(
            wait::Id::All,
            wait::WaitPidFlag::WEXITED | wait::WaitPidFlag::WNOHANG | wait::WaitPidFlag::WNOWAIT,
        );
        let pid = match res {
            Ok(wait::WaitStatus::Exited(pid, _)) | Ok(wait::WaitStatus::Signaled(pid, _, _)) => {
                pid
            }
            Ok(wait::WaitStatus::StillAlive) => return Ok(ReapOutcome::Continue),
            Ok(status) => {
                return Err(tag!("Unexpected process status: {:?}", status));
            }
            Err(Errno::ECHILD) => return Ok(ReapOutcome::Continue),
            Err(Errno::EINTR) => continue,
            Err(e) => {
                return Err(tag!("waitid failed: {}", e));
            }
        };
        if pid.as_raw() as u32 == app.id() {
            let code = match app.wait() {
                Ok(status) => status.code().unwrap_or(1),
                Err(_) => 1,
            };
            debug!("Application has exited with status {}", code);
            return Ok(ReapOutcome::AppExited(code));
        }
        if let Some(i) = rows.iter().position(|r| r.child.id() == pid.as_raw() as u32) {
            let mut row = rows.remove(i);
            debug!("Connection worker {} has exited", row.child.id());
            let _ = row.child.wait();
            /* drop(row.link_fd) closes the supervisor's link end */
        } else {
            error!("Received SIGCHLD for unexpected child: {}", pid.as_raw());
        }
    }
}

/** Multi runner: accept loop over the display socket plus control-pipe
 * migrations. Returns the application's exit status. */
fn run_multi(
    cfg: &ServerConfig,
    opts: &Options,
    control_pipe: Option<OwnedFd>,
    display_socket: OwnedFd,
    app: &mut Child,
    minter: &mut TokenMinter,
) -> Result<i32, String> {
    let mut pollmask = signal::SigSet::empty();
    setup_sigchld(&mut pollmask)?;

    let self_path = get_self_path()?;
    let reconnectable = control_pipe.is_some();
    let mut rows: Vec<ConnRow> = Vec::new();
    let mut current_addr = cfg.socket_path.clone();
    let mut retcode = 0;

    socket::listen(&display_socket, socket::Backlog::new(128).unwrap())
        .map_err(|x| tag!("Failed to listen on display socket: {}", x))?;

    while !shutdown_requested() {
        match reap_children(app, &mut rows)? {
            ReapOutcome::AppExited(code) => {
                retcode = code;
                break;
            }
            ReapOutcome::Continue => (),
        }

        let mut pfds = Vec::with_capacity(2);
        pfds.push(PollFd::new(display_socket.as_fd(), PollFlags::POLLIN));
        if let Some(ref cp) = control_pipe {
            pfds.push(PollFd::new(cp.as_fd(), PollFlags::POLLIN));
        }
        match nix::poll::ppoll(&mut pfds, None, Some(pollmask)) {
            Ok(_) => (),
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
            Err(e) => {
                return Err(tag!("Poll failed: {}", e));
            }
        }

        if pfds.len() > 1
            && pfds[1]
                .revents()
                .unwrap_or(PollFlags::empty())
                .contains(PollFlags::POLLIN)
        {
            match read_socket_path(control_pipe.as_ref().unwrap()) {
                Ok(new_addr) => {
                    let links: Vec<(ConnectionToken, &OwnedFd)> = rows
                        .iter()
                        .filter_map(|r| r.link_fd.as_ref().map(|l| (r.token, l)))
                        .collect();
                    if let Err(e) = update_connections(
                        &mut current_addr,
                        &new_addr,
                        &links,
                        cfg.unlink_at_end,
                    ) {
                        error!("Connection migration failed: {}", e);
                    }
                }
                Err(e) => {
                    error!("Ignoring control pipe input: {}", e);
                }
            }
        }

        if !pfds[0]
            .revents()
            .unwrap_or(PollFlags::empty())
            .contains(PollFlags::POLLIN)
        {
            continue;
        }
        let app_fd = match socket::accept(display_socket.as_raw_fd()) {
            Ok(fd) => unsafe {
                // SAFETY: freshly created fd, exclusively captured here
                OwnedFd::from_raw_fd(fd)
            },
            Err(Errno::EAGAIN) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                /* Can fail for a variety of reasons (OOM, aborted
                 * connection); the display socket itself is still fine */
                debug!("Failed to accept connection: {}", e);
                continue;
            }
        };
        debug!("Connection received");

        /* Per-connection failures lose that connection only */
        let token = match minter.mint(reconnectable, false) {
            Ok(t) => t,
            Err(e) => {
                error!("Dropping connection: {}", e);
                continue;
            }
        };
        let chanfd = match dial_unix(&current_addr) {
            Ok(c) => c,
            Err(e) => {
                error!("Dropping connection: {}", e);
                continue;
            }
        };
        if let Err(e) = write_all(&chanfd, &token.to_bytes()) {
            error!("Dropping connection: failed to write token: {}", e);
            continue;
        }
        let mut sup_link: Option<OwnedFd> = None;
        let mut worker_link: Option<OwnedFd> = None;
        if reconnectable {
            match socket::socketpair(
                socket::AddressFamily::Unix,
                socket::SockType::Stream,
                None,
                socket::SockFlag::SOCK_CLOEXEC,
            ) {
                Ok((a, b)) => {
                    sup_link = Some(a);
                    worker_link = Some(b);
                }
                Err(e) => {
                    error!("Dropping connection: socketpair failed: {}", e);
                    continue;
                }
            }
        }
        match spawn_connection_worker(&self_path, chanfd, app_fd, worker_link, opts) {
            Ok(child) => {
                rows.push(ConnRow {
                    token,
                    child,
                    link_fd: sup_link,
                });
            }
            Err(e) => {
                error!("Dropping connection: {}", e);
            }
        }
    }

    if cfg.unlink_at_end {
        if let Err(e) = unistd::unlink(&current_addr) {
            debug!("Failed to unlink channel socket {:?}: {}", current_addr, e);
        }
    }

    /* Close link fds, then wait for the remaining workers */
    for mut row in rows.drain(..) {
        drop(row.link_fd);
        debug!("Waiting for connection worker {}", row.child.id());
        let _ = row.child.wait();
    }
    Ok(retcode)
}

/** Run the server-side session supervisor.
 *
 * Returns the exit status to propagate: the application's own status on a
 * normal run, or an error for supervisor-level bring-up failures. */
pub fn run_server(cfg: &ServerConfig, opts: &Options) -> Result<i32, String> {
    debug!(
        "Server supervisor starting; channel {:?}, oneshot: {}",
        cfg.socket_path, cfg.oneshot
    );
    let mut minter = TokenMinter::new();
    let pollmask = setup_shutdown_handler()?;

    /* Set up the application's connection before launching it */
    let mut app_socket: Option<OwnedFd> = None; /* child's end, oneshot */
    let mut worker_app_fd: Option<OwnedFd> = None;
    let mut display_socket: Option<OwnedFd> = None;
    let mut display_path: Option<PathBuf> = None;
    if cfg.oneshot {
        let (ours, theirs) = socket::socketpair(
            socket::AddressFamily::Unix,
            socket::SockType::Stream,
            None,
            socket::SockFlag::SOCK_CLOEXEC,
        )
        .map_err(|x| tag!("Failed to create socketpair: {}", x))?;
        worker_app_fd = Some(ours);
        app_socket = Some(theirs);
    } else {
        let path = display_socket_path(&cfg.wayland_display)?;
        let sock = socket::socket(
            socket::AddressFamily::Unix,
            socket::SockType::Stream,
            socket::SockFlag::SOCK_NONBLOCK | socket::SockFlag::SOCK_CLOEXEC,
            None,
        )
        .map_err(|x| tag!("Failed to create display socket: {}", x))?;
        let addr = socket::UnixAddr::new(&path)
            .map_err(|x| tag!("Failed to make socket address from {:?}: {}", path, x))?;
        socket::bind(sock.as_raw_fd(), &addr)
            .map_err(|x| tag!("Failed to bind display socket at {:?}: {}", path, x))?;
        display_socket = Some(sock);
        display_path = Some(path);
    }

    let mut app = spawn_application(cfg, app_socket.as_ref())?;
    /* The child owns its end now */
    drop(app_socket);

    let control_pipe = match &cfg.control_path {
        Some(p) => Some(open_control_pipe(p)?),
        None => None,
    };

    let result = if cfg.oneshot {
        run_oneshot(
            cfg,
            opts,
            control_pipe,
            worker_app_fd.take().unwrap(),
            &mut minter,
            pollmask,
        )
        .map(|()| wait_application(&mut app))
    } else {
        run_multi(
            cfg,
            opts,
            control_pipe,
            display_socket.take().unwrap(),
            &mut app,
            &mut minter,
        )
    };

    /* Remove the filesystem objects this session created */
    if let Some(p) = &cfg.control_path {
        if let Err(e) = unistd::unlink(p) {
            error!("Failed to unlink control FIFO {:?}: {}", p, e);
        }
    }
    if let Some(p) = display_path {
        if let Err(e) = unistd::unlink(&p) {
            error!("Failed to unlink display socket {:?}: {}", p, e);
        }
    }

    debug!("Supervisor finished");
    result
}
