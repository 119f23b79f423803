//! Harness for driving a real supervisor process over its sockets.

use std::{
    fs,
    io::{BufRead, BufReader, Write},
    net::TcpStream,
    path::PathBuf,
    process::{Child, Command, Stdio},
    time::{Duration, Instant},
};

pub fn nexus_bin() -> &'static str {
    env!("CARGO_BIN_EXE_nexus")
}

pub fn actors_bin() -> &'static str {
    env!("CARGO_BIN_EXE_sample-actors")
}

pub struct NexusHandle {
    child: Child,
    control: BufReader<TcpStream>,
    output: BufReader<TcpStream>,
    output_partial: String,
    pub control_port: u16,
    pub output_port: u16,
    pub workdir: PathBuf,
}

impl NexusHandle {
    /// Write the pipeline document into a fresh working directory and
    /// start a supervisor on auto-allocated ports.
    pub fn start(test: &str, config: &str) -> NexusHandle {
        let workdir = PathBuf::from(format!(
            "/tmp/nexus-e2e-{}-{}",
            test,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&workdir);
        Self::start_in(workdir, config)
    }

    /// Start a supervisor in an existing working directory, e.g. to warm
    /// restart over a persistence directory from an earlier run.
    pub fn start_in(workdir: PathBuf, config: &str) -> NexusHandle {
        fs::create_dir_all(&workdir).unwrap();
        let config_path = workdir.join("pipeline.yaml");
        fs::write(&config_path, config).unwrap();

        let mut child = Command::new(nexus_bin())
            .arg("serve")
            .arg("-c")
            .arg(&config_path)
            .current_dir(&workdir)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();

        // first stdout line carries the bound ports
        let stdout = child.stdout.take().unwrap();
        let mut lines = BufReader::new(stdout);
        let mut line = String::new();
        lines.read_line(&mut line).unwrap();
        let (control_port, output_port) = parse_ports(line.trim());

        let control = connect(control_port);
        let output = connect(output_port);
        output
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();

        NexusHandle {
            child,
            control: BufReader::new(control),
            output: BufReader::new(output),
            output_partial: String::new(),
            control_port,
            output_port,
            workdir,
        }
    }

    /// Send one command line; returns the (always identical) reply.
    pub fn command(&mut self, command: &str) -> String {
        let stream = self.control.get_mut();
        stream
            .write_all(format!("{}\n", command).as_bytes())
            .unwrap();
        let mut reply = String::new();
        self.control.read_line(&mut reply).unwrap();
        reply.trim().to_string()
    }

    /// Read output lines until one contains `needle`.
    pub fn expect_output(&mut self, needle: &str, timeout: Duration) {
        self.expect_output_all(&[needle], timeout);
    }

    /// Read output lines until every needle has been seen, in any order.
    pub fn expect_output_all(&mut self, needles: &[&str], timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut seen = vec![false; needles.len()];
        while Instant::now() < deadline {
            match self.output.read_line(&mut self.output_partial) {
                Ok(0) => break,
                Ok(_) => {
                    let line = std::mem::take(&mut self.output_partial);
                    for (index, needle) in needles.iter().enumerate() {
                        if line.contains(needle) {
                            seen[index] = true;
                        }
                    }
                    if seen.iter().all(|found| *found) {
                        return;
                    }
                }
                // timeouts leave a partial line in the buffer; keep it
                Err(_) => continue,
            }
        }
        panic!(
            "gave up waiting for {:?} on the output socket (seen: {:?})",
            needles, seen
        );
    }

    /// Wait for the supervisor process to exit; panics past `timeout`.
    pub fn wait_exit(mut self, timeout: Duration) -> i32 {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.child.try_wait().unwrap() {
                return status.code().unwrap_or(-1);
            }
            if Instant::now() > deadline {
                let _ = self.child.kill();
                panic!("supervisor did not exit within {:?}", timeout);
            }
            std::thread::sleep(Duration::from_millis(100));
        }
    }
}

impl Drop for NexusHandle {
    fn drop(&mut self) {
        let _ = self.child.kill();
    }
}

fn parse_ports(line: &str) -> (u16, u16) {
    let mut control = 0;
    let mut output = 0;
    for word in line.split_whitespace() {
        if let Some(value) = word.strip_prefix("control_port=") {
            control = value.parse().unwrap();
        }
        if let Some(value) = word.strip_prefix("output_port=") {
            output = value.parse().unwrap();
        }
    }
    assert!(control != 0 && output != 0, "bad port line: '{}'", line);
    (control, output)
}

fn connect(port: u16) -> TcpStream {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(stream) => return stream,
            Err(error) => {
                if Instant::now() > deadline {
                    panic!("could not connect to port {}: {}", port, error);
                }
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }
}
