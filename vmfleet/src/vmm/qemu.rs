//! QEMU command builder and launcher.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use vmfleet_shared::errors::PreconditionError;

use super::{LaunchMode, LaunchSpec, ProcessHandle, VmLauncher};
use crate::auth::AuthContext;
use crate::net::mac_string;
use crate::util::process::{is_process_alive, read_pid_file};
use crate::util::{find_in_path, run_tool};

/// Builder for constructing QEMU command arguments.
#[derive(Debug, Clone, Default)]
pub struct QemuCommand {
    args: Vec<String>,
}

impl QemuCommand {
    pub fn new() -> Self {
        Self { args: Vec::new() }
    }

    fn push(mut self, flag: &str, value: impl Into<String>) -> Self {
        self.args.push(flag.to_string());
        self.args.push(value.into());
        self
    }

    fn flag(mut self, flag: &str) -> Self {
        self.args.push(flag.to_string());
        self
    }

    /// `-accel <accel> -machine virt,highmem=on -cpu host`
    pub fn with_machine(self, accel: &str) -> Self {
        self.push("-accel", accel)
            .push("-machine", "virt,highmem=on")
            .push("-cpu", "host")
    }

    pub fn smp(self, vcpus: u32) -> Self {
        self.push("-smp", vcpus.to_string())
    }

    pub fn memory(self, mib: u32) -> Self {
        self.push("-m", mib.to_string())
    }

    /// Firmware code blob, read-only.
    pub fn bios(self, path: impl AsRef<Path>) -> Self {
        self.push("-bios", display(path))
    }

    /// Writable firmware variable store on the second pflash unit.
    pub fn pflash_vars(self, path: impl AsRef<Path>) -> Self {
        self.push(
            "-drive",
            format!("if=pflash,format=raw,unit=1,file={}", display(path)),
        )
    }

    /// Root disk. No host caching and discard passthrough keep the overlay
    /// sparse.
    pub fn root_overlay(self, path: impl AsRef<Path>) -> Self {
        self.push(
            "-drive",
            format!(
                "if=virtio,file={},format=qcow2,cache=none,discard=unmap",
                display(path)
            ),
        )
    }

    /// Init volume, read-only.
    pub fn seed_volume(self, path: impl AsRef<Path>) -> Self {
        self.push(
            "-drive",
            format!("if=virtio,file={},format=raw,readonly=on", display(path)),
        )
    }

    pub fn nic(self, backend: &str, interface_key: &str, bridge: &str, mac: &str) -> Self {
        self.push(
            "-nic",
            format!("{backend},{interface_key}={bridge},model=virtio-net-pci,mac={mac}"),
        )
    }

    pub fn uuid(self, uuid: &uuid::Uuid) -> Self {
        self.push("-uuid", uuid.to_string())
    }

    pub fn name(self, name: &str) -> Self {
        self.push("-name", name)
    }

    /// Detach from the terminal, record the pid, and expose the serial
    /// console on a unix socket.
    pub fn daemonize(
        self,
        pid_file: impl AsRef<Path>,
        console_socket: impl AsRef<Path>,
        log_file: impl AsRef<Path>,
    ) -> Self {
        self.flag("-daemonize")
            .push("-pidfile", display(pid_file))
            .push("-display", "none")
            .push("-monitor", "none")
            .push(
                "-serial",
                format!("unix:{},server=on,wait=off", display(console_socket)),
            )
            .push("-D", display(log_file))
    }

    /// Serial console on stdio, no display.
    pub fn nographic(self) -> Self {
        self.flag("-nographic")
    }

    /// Full argument list for `spec`.
    pub fn for_spec(spec: &LaunchSpec) -> Self {
        let cmd = Self::new()
            .with_machine(spec.accel.as_str())
            .smp(spec.resources.vcpus)
            .memory(spec.resources.memory_mib)
            .bios(&spec.firmware)
            .pflash_vars(&spec.vars)
            .root_overlay(&spec.overlay)
            .seed_volume(&spec.seed_volume)
            .nic(
                spec.backend.as_str(),
                spec.backend.interface_key(),
                &spec.bridge,
                &mac_string(&spec.mac),
            )
            .uuid(&spec.uuid)
            .name(&spec.name);

        match spec.mode {
            LaunchMode::Daemonized => {
                cmd.daemonize(&spec.pid_file, &spec.console_socket, &spec.log_file)
            }
            LaunchMode::Foreground => cmd.nographic(),
        }
    }

    /// Get the arguments as a vector (for testing/debugging).
    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn into_args(self) -> Vec<String> {
        self.args
    }
}

fn display(path: impl AsRef<Path>) -> String {
    path.as_ref().to_string_lossy().into_owned()
}

/// Launches instances with a QEMU system emulator binary.
#[derive(Debug, Clone)]
pub struct QemuLauncher {
    binary: PathBuf,
    settle: Duration,
}

impl QemuLauncher {
    /// Emulator used when none is configured.
    pub const DEFAULT_BINARY: &'static str = "qemu-system-aarch64";

    /// How long a foreground engine must survive to count as started.
    pub const DEFAULT_SETTLE: Duration = Duration::from_millis(500);

    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            settle: Self::DEFAULT_SETTLE,
        }
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Resolve `binary` (a name in `PATH` or a path).
    pub fn locate(binary: &str) -> Result<Self, PreconditionError> {
        find_in_path(binary)
            .map(Self::new)
            .ok_or_else(|| PreconditionError::MissingTool {
                tool: binary.to_string(),
            })
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    async fn launch_daemonized(
        &self,
        spec: &LaunchSpec,
        auth: &AuthContext,
    ) -> Result<ProcessHandle, String> {
        // A leftover pidfile would report the previous run's pid
        if spec.pid_file.exists() {
            let mut rm = auth.command("rm");
            rm.arg("-f").arg(&spec.pid_file);
            run_tool(&mut rm).await?;
        }

        let mut cmd = auth.command(&self.binary);
        cmd.args(QemuCommand::for_spec(spec).into_args())
            .stdin(Stdio::null());
        run_tool(&mut cmd).await?;

        let pid = read_engine_pid(spec, auth).await;
        match pid {
            Some(pid) if !is_process_alive(pid) => {
                tracing::warn!(index = spec.index, pid, "Engine exited right after daemonizing");
                Ok(ProcessHandle::exited(Some(pid), None))
            }
            _ => Ok(ProcessHandle::running(pid)),
        }
    }

    async fn launch_foreground(
        &self,
        spec: &LaunchSpec,
        auth: &AuthContext,
    ) -> Result<ProcessHandle, String> {
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.log_file)
            .map_err(|e| format!("failed to open {}: {e}", spec.log_file.display()))?;
        let log_err = log
            .try_clone()
            .map_err(|e| format!("failed to duplicate log handle: {e}"))?;

        let mut cmd = auth.command(&self.binary);
        cmd.args(QemuCommand::for_spec(spec).into_args())
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err)
            // Own process group: a Ctrl-C in the orchestrator's terminal
            // does not reach the instance
            .process_group(0)
            .kill_on_drop(false);

        let mut child = cmd
            .spawn()
            .map_err(|e| format!("failed to start {}: {e}", self.binary.display()))?;
        let pid = child.id();

        // Bad arguments or a busy bridge make the engine quit at once
        tokio::time::sleep(self.settle).await;
        match child.try_wait() {
            Ok(Some(status)) => {
                tracing::warn!(
                    index = spec.index,
                    %status,
                    log = %spec.log_file.display(),
                    "Engine exited during startup"
                );
                Ok(ProcessHandle::exited(pid, status.code()))
            }
            Ok(None) => Ok(ProcessHandle::running(pid)),
            Err(e) => {
                tracing::warn!(index = spec.index, error = %e, "Could not poll engine process");
                Ok(ProcessHandle::running(pid))
            }
        }
    }
}

/// Read the pid the engine wrote, using elevation if the file is not
/// readable by us.
async fn read_engine_pid(spec: &LaunchSpec, auth: &AuthContext) -> Option<u32> {
    match read_pid_file(&spec.pid_file) {
        Ok(pid) => return Some(pid),
        Err(e) if !auth.is_elevated() => {
            tracing::warn!(index = spec.index, error = %e, "Could not read engine pidfile");
            return None;
        }
        Err(_) => {}
    }

    let mut cat = auth.command("cat");
    cat.arg(&spec.pid_file);
    match run_tool(&mut cat).await {
        Ok(output) => String::from_utf8_lossy(&output.stdout).trim().parse().ok(),
        Err(e) => {
            tracing::warn!(index = spec.index, error = %e, "Could not read engine pidfile");
            None
        }
    }
}

#[async_trait]
impl VmLauncher for QemuLauncher {
    fn name(&self) -> &str {
        "qemu"
    }

    fn command_line(&self, spec: &LaunchSpec, auth: &AuthContext) -> Vec<String> {
        let mut line = auth.prefix();
        line.push(display(&self.binary));
        line.extend(QemuCommand::for_spec(spec).into_args());
        line
    }

    async fn launch(&self, spec: &LaunchSpec, auth: &AuthContext) -> Result<ProcessHandle, String> {
        tracing::info!(
            index = spec.index,
            name = %spec.name,
            mode = ?spec.mode,
            "Launching instance"
        );
        match spec.mode {
            LaunchMode::Daemonized => self.launch_daemonized(spec, auth).await,
            LaunchMode::Foreground => self.launch_foreground(spec, auth).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::instance_mac;
    use crate::request::Resources;
    use crate::vmm::{Accelerator, NetBackend};
    use uuid::Uuid;

    fn spec(mode: LaunchMode) -> LaunchSpec {
        LaunchSpec {
            index: 2,
            name: "overlay-2".into(),
            uuid: Uuid::nil(),
            mac: instance_mac(2),
            resources: Resources {
                vcpus: 2,
                memory_mib: 2048,
            },
            firmware: "/opt/edk2-aarch64-code.fd".into(),
            vars: "/w/overlays/vars-2.fd".into(),
            overlay: "/w/overlays/root-2.qcow2".into(),
            seed_volume: "/w/seeds/seed-2.iso".into(),
            bridge: "en1".into(),
            backend: NetBackend::VmnetBridged,
            accel: Accelerator::Hvf,
            mode,
            pid_file: "/w/run/overlay-2.pid".into(),
            log_file: "/w/run/overlay-2.log".into(),
            console_socket: "/w/run/overlay-2.console.sock".into(),
        }
    }

    fn value_of<'a>(args: &'a [String], flag: &str) -> Vec<&'a str> {
        args.windows(2)
            .filter(|w| w[0] == flag)
            .map(|w| w[1].as_str())
            .collect()
    }

    #[test]
    fn test_daemonized_arguments() {
        let cmd = QemuCommand::for_spec(&spec(LaunchMode::Daemonized));
        let args = cmd.args();

        assert_eq!(value_of(args, "-accel"), ["hvf"]);
        assert_eq!(value_of(args, "-smp"), ["2"]);
        assert_eq!(value_of(args, "-m"), ["2048"]);
        assert_eq!(value_of(args, "-bios"), ["/opt/edk2-aarch64-code.fd"]);
        assert_eq!(
            value_of(args, "-drive"),
            [
                "if=pflash,format=raw,unit=1,file=/w/overlays/vars-2.fd",
                "if=virtio,file=/w/overlays/root-2.qcow2,format=qcow2,cache=none,discard=unmap",
                "if=virtio,file=/w/seeds/seed-2.iso,format=raw,readonly=on",
            ]
        );
        assert_eq!(
            value_of(args, "-nic"),
            ["vmnet-bridged,ifname=en1,model=virtio-net-pci,mac=52:54:00:f1:33:12"]
        );
        assert_eq!(
            value_of(args, "-uuid"),
            ["00000000-0000-0000-0000-000000000000"]
        );
        assert_eq!(value_of(args, "-name"), ["overlay-2"]);
        assert!(args.iter().any(|a| a == "-daemonize"));
        assert_eq!(value_of(args, "-pidfile"), ["/w/run/overlay-2.pid"]);
        assert_eq!(
            value_of(args, "-serial"),
            ["unix:/w/run/overlay-2.console.sock,server=on,wait=off"]
        );
        assert!(!args.iter().any(|a| a == "-nographic"));
    }

    #[test]
    fn test_foreground_and_linux_bridge() {
        let mut s = spec(LaunchMode::Foreground);
        s.backend = NetBackend::Bridge;
        s.bridge = "br0".into();
        let args = QemuCommand::for_spec(&s).into_args();

        assert!(args.iter().any(|a| a == "-nographic"));
        assert!(!args.iter().any(|a| a == "-daemonize"));
        assert_eq!(
            value_of(&args, "-nic"),
            ["bridge,br=br0,model=virtio-net-pci,mac=52:54:00:f1:33:12"]
        );
    }

    #[test]
    fn test_command_line_includes_elevation() {
        let launcher = QemuLauncher::new("/usr/bin/qemu-system-aarch64");
        let auth = AuthContext::Sudo {
            binary: "/usr/bin/sudo".into(),
        };
        let line = launcher.command_line(&spec(LaunchMode::Daemonized), &auth);
        assert_eq!(
            &line[..3],
            ["/usr/bin/sudo", "-n", "/usr/bin/qemu-system-aarch64"]
        );
    }

    #[test]
    fn test_locate_missing_binary() {
        let err = QemuLauncher::locate("qemu-system-imaginary-7f3a").unwrap_err();
        assert!(matches!(err, PreconditionError::MissingTool { .. }));
    }

    #[tokio::test]
    async fn test_daemonized_reads_pidfile() {
        let temp = tempfile::TempDir::new().unwrap();
        let fake = temp.path().join("fake-qemu");
        // Writes the value after -pidfile, like the real engine does
        std::fs::write(
            &fake,
            "#!/bin/sh\nwhile [ $# -gt 0 ]; do\n  if [ \"$1\" = \"-pidfile\" ]; then echo 4242 > \"$2\"; fi\n  shift\ndone\n",
        )
        .unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut s = spec(LaunchMode::Daemonized);
        s.pid_file = temp.path().join("overlay-2.pid");
        std::fs::write(&s.pid_file, "1\n").unwrap();

        let handle = QemuLauncher::new(&fake)
            .launch(&s, &AuthContext::Unprivileged)
            .await
            .unwrap();
        assert_eq!(handle.pid, Some(4242));
    }

    #[tokio::test]
    async fn test_daemonized_dead_pid_reports_exit() {
        let temp = tempfile::TempDir::new().unwrap();
        let fake = temp.path().join("fake-qemu");
        // Reports a pid that cannot exist
        std::fs::write(
            &fake,
            "#!/bin/sh\nwhile [ $# -gt 0 ]; do\n  if [ \"$1\" = \"-pidfile\" ]; then echo 999999999 > \"$2\"; fi\n  shift\ndone\n",
        )
        .unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut s = spec(LaunchMode::Daemonized);
        s.pid_file = temp.path().join("overlay-2.pid");

        let handle = QemuLauncher::new(&fake)
            .launch(&s, &AuthContext::Unprivileged)
            .await
            .unwrap();
        assert_eq!(handle, ProcessHandle::exited(Some(999999999), None));
    }

    #[tokio::test]
    async fn test_foreground_immediate_exit_is_reported() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut s = spec(LaunchMode::Foreground);
        s.log_file = temp.path().join("overlay-2.log");

        let handle = QemuLauncher::new("/bin/false")
            .with_settle(Duration::from_millis(300))
            .launch(&s, &AuthContext::Unprivileged)
            .await
            .unwrap();
        assert!(handle.pid.is_some());
        assert_eq!(handle.exit.map(|e| e.code), Some(Some(1)));
        assert!(s.log_file.exists());
    }

    #[tokio::test]
    async fn test_foreground_live_engine_is_running() {
        let temp = tempfile::TempDir::new().unwrap();
        let fake = temp.path().join("fake-qemu");
        std::fs::write(&fake, "#!/bin/sh\nexec sleep 5\n").unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut s = spec(LaunchMode::Foreground);
        s.log_file = temp.path().join("overlay-2.log");

        let handle = QemuLauncher::new(&fake)
            .with_settle(Duration::from_millis(100))
            .launch(&s, &AuthContext::Unprivileged)
            .await
            .unwrap();
        assert_eq!(handle.exit, None);
        let pid = handle.pid.unwrap();
        unsafe {
            libc::kill(pid as i32, libc::SIGKILL);
        }
    }

    #[tokio::test]
    async fn test_daemonized_nonzero_exit_fails() {
        let mut s = spec(LaunchMode::Daemonized);
        let temp = tempfile::TempDir::new().unwrap();
        s.pid_file = temp.path().join("overlay-2.pid");

        let err = QemuLauncher::new("/bin/false")
            .launch(&s, &AuthContext::Unprivileged)
            .await
            .unwrap_err();
        assert!(err.contains("exited with"), "{err}");
    }
}
