//! End-to-end runs of the `mqttd` binary.

use std::net::TcpListener;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use mqttd::process::pidfile::read_pid_file;

fn mqttd() -> Command {
    Command::new(env!("CARGO_BIN_EXE_mqttd"))
}

fn wait_for(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    cond()
}

#[test]
fn daemon_writes_pid_of_detached_child_and_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("run/mqttd.pid");
    let log_file = dir.path().join("mqttd.log");
    let socket = dir.path().join("mqttd.sock");
    let config = dir.path().join("mqttd.toml");
    std::fs::write(
        &config,
        format!(
            r#"
daemon = true
user = "root"
pid_file = "{}"

[observability]
log_file = "{}"

[[listeners]]
unix_socket_path = "{}"
"#,
            pid_file.display(),
            log_file.display(),
            socket.display()
        ),
    )
    .unwrap();

    let mut child = mqttd().arg("-c").arg(&config).spawn().unwrap();
    let launcher_pid = child.id();
    let status = child.wait().unwrap();
    assert!(status.success(), "launcher exited with {status}");

    assert!(
        wait_for(|| read_pid_file(&pid_file).is_ok(), Duration::from_secs(5)),
        "pid file never appeared"
    );
    let daemon_pid = read_pid_file(&pid_file).unwrap();
    assert_ne!(daemon_pid, launcher_pid);
    assert!(wait_for(|| socket.exists(), Duration::from_secs(5)));

    kill(Pid::from_raw(daemon_pid as i32), Signal::SIGTERM).unwrap();

    assert!(
        wait_for(|| !pid_file.exists(), Duration::from_secs(10)),
        "pid file left behind"
    );
    assert!(wait_for(|| !socket.exists(), Duration::from_secs(5)));
    let log = std::fs::read_to_string(&log_file).unwrap();
    assert!(log.contains("Shutdown complete"));
}

#[test]
fn second_sigterm_exits_without_draining() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("mqttd.sock");
    let config = dir.path().join("mqttd.toml");
    std::fs::write(
        &config,
        format!(
            r#"
user = "root"

[lifecycle]
poll_interval_ms = 5000
drain_timeout_secs = 60

[[listeners]]
unix_socket_path = "{}"
"#,
            socket.display()
        ),
    )
    .unwrap();

    let mut child = mqttd()
        .arg("-c")
        .arg(&config)
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    assert!(wait_for(|| socket.exists(), Duration::from_secs(5)), "broker never listened");
    let _session = std::os::unix::net::UnixStream::connect(&socket).unwrap();
    // Let the run loop take its first, immediate look at the flags.
    std::thread::sleep(Duration::from_millis(300));

    let pid = Pid::from_raw(child.id() as i32);
    kill(pid, Signal::SIGTERM).unwrap();
    // The run loop only looks at the flags every five seconds.
    std::thread::sleep(Duration::from_millis(200));
    kill(pid, Signal::SIGTERM).unwrap();

    let started = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait().unwrap() {
            break status;
        }
        assert!(started.elapsed() < Duration::from_secs(5), "broker still running");
        std::thread::sleep(Duration::from_millis(25));
    };
    assert_eq!(status.code(), Some(128 + libc::SIGTERM));
}

#[test]
fn missing_config_file_is_a_config_error() {
    let output = mqttd()
        .arg("-c")
        .arg(Path::new("/nonexistent/mqttd.toml"))
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn busy_port_is_a_bind_error() {
    let holder = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = holder.local_addr().unwrap().port();

    let output = mqttd().arg("-p").arg(port.to_string()).output().unwrap();
    assert_eq!(output.status.code(), Some(6));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains(&port.to_string()), "stderr: {stderr}");
}
