//! Agent module loaded into a target by wintime.
//!
//! On load it picks up the channel name from the environment and removes its
//! own traces from the environment, so processes the target starts neither
//! load the agent nor see the channel. At process teardown it reads the peak
//! memory counters of the process it lives in and sends them, once, to the
//! watcher. A forked copy of the process never sends.
//!
//! Nothing here may disturb the target: every failure is swallowed, and no
//! tracing subscriber is ever installed.

use std::sync::OnceLock;
use wintime::channel::{ChannelClient, ENV_VAR};
use wintime::probe;

struct Registration {
    pid: u32,
    client: ChannelClient,
}

static REGISTRATION: OnceLock<Registration> = OnceLock::new();

/// File name prefix of the agent module in a preload list.
#[cfg(unix)]
const MODULE_PREFIX: &str = "libwintime_agent";

fn on_load() {
    match ChannelClient::from_env() {
        Ok(client) => {
            let _ = REGISTRATION.set(Registration {
                pid: std::process::id(),
                client,
            });
        }
        Err(e) => tracing::debug!(error = %e, "agent loaded without a channel"),
    }
    scrub_environment();
}

fn on_unload() {
    let _ = std::panic::catch_unwind(|| {
        let Some(registration) = REGISTRATION.get() else {
            return;
        };
        if registration.pid != std::process::id() {
            return;
        }
        match probe::own_counters() {
            Some(counters) => {
                registration.client.send_or_log(&counters);
            }
            None => tracing::warn!("memory counters unavailable at teardown"),
        }
    });
}

#[cfg(unix)]
fn scrub_environment() {
    std::env::remove_var(ENV_VAR);
    if let Ok(preload) = std::env::var("LD_PRELOAD") {
        match strip_agent(&preload) {
            Some(rest) => std::env::set_var("LD_PRELOAD", rest),
            None => std::env::remove_var("LD_PRELOAD"),
        }
    }
}

#[cfg(windows)]
fn scrub_environment() {
    std::env::remove_var(ENV_VAR);
}

/// The preload list without agent entries; `None` if nothing is left.
#[cfg(unix)]
fn strip_agent(preload: &str) -> Option<String> {
    let rest: Vec<&str> = preload
        .split([':', ' '])
        .filter(|entry| !entry.is_empty())
        .filter(|&entry| {
            let name = entry.rsplit('/').next().unwrap_or(entry);
            !name.starts_with(MODULE_PREFIX)
        })
        .collect();
    if rest.is_empty() {
        None
    } else {
        Some(rest.join(":"))
    }
}

#[cfg(target_os = "linux")]
mod hooks {
    extern "C" fn load() {
        super::on_load();
    }

    extern "C" fn unload() {
        super::on_unload();
    }

    #[used]
    #[link_section = ".init_array"]
    static LOAD: extern "C" fn() = load;

    #[used]
    #[link_section = ".fini_array"]
    static UNLOAD: extern "C" fn() = unload;
}

#[cfg(windows)]
mod hooks {
    use std::ffi::c_void;
    use windows::Win32::Foundation::{BOOL, HINSTANCE, TRUE};
    use windows::Win32::System::SystemServices::{DLL_PROCESS_ATTACH, DLL_PROCESS_DETACH};

    #[no_mangle]
    #[allow(non_snake_case)]
    pub extern "system" fn DllMain(_module: HINSTANCE, reason: u32, _reserved: *mut c_void) -> BOOL {
        match reason {
            DLL_PROCESS_ATTACH => super::on_load(),
            DLL_PROCESS_DETACH => super::on_unload(),
            _ => {}
        }
        TRUE
    }
}
