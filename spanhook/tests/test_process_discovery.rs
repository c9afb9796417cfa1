use std::net::TcpListener;
use std::path::PathBuf;

use spanhook::discovery::{ProcFinder, ProcessFinder, ProcessNamed};
use spanhook::domain::{Pid, Port};

fn own_pid() -> Pid {
    Pid(std::process::id() as i32)
}

#[test]
fn test_finds_own_process_by_name() {
    let exe = std::env::current_exe().expect("current exe");
    let name = exe.file_name().unwrap().to_string_lossy().into_owned();
    println!("Looking for: {name}");

    let found = ProcFinder::default().find_by_name(&ProcessNamed::new(name)).expect("scan /proc");
    let me = found.iter().find(|info| info.pid == own_pid()).expect("own process not found");

    assert_eq!(me.pro_exe_link_path, PathBuf::from(format!("/proc/{}/exe", own_pid().0)));
    assert!(!me.image.is_empty());
}

#[test]
fn test_finds_own_process_by_port() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    println!("Listening on: {port}");

    let found = ProcFinder::default().find_by_port(Port(port)).expect("scan /proc");
    assert!(found.iter().any(|info| info.pid == own_pid()), "listener owner not found");
}

#[test]
fn test_unused_port_has_no_owner() {
    // Bind then release to get a port nobody listens on
    let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
    let found = ProcFinder::default().find_by_port(Port(port)).expect("scan /proc");
    assert!(found.is_empty());
}
