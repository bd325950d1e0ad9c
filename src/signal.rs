use tokio::signal::unix::{Signal, SignalKind, signal};

/// Control messages the process reacts to.
#[derive(Debug, PartialEq)]
pub enum SignalTo {
    /// Read the config file again and apply it
    Reload,
    /// Cancel the group and exit
    Shutdown,
}

pub struct Signals {
    sigint: Signal,
    sigterm: Signal,
    sighup: Signal,
}

impl Signals {
    pub async fn recv(&mut self) -> SignalTo {
        tokio::select! {
            _ = self.sigint.recv() => {
                info!(message = "Signal received", signal = "SIGINT");
                SignalTo::Shutdown
            }
            _ = self.sigterm.recv() => {
                info!(message = "Signal received", signal = "SIGTERM");
                SignalTo::Shutdown
            }
            _ = self.sighup.recv() => {
                info!(message = "Signal received", signal = "SIGHUP");
                SignalTo::Reload
            }
        }
    }
}

/// Signals from OS/user
pub fn os_signals() -> std::io::Result<Signals> {
    Ok(Signals {
        sigint: signal(SignalKind::interrupt())?,
        sigterm: signal(SignalKind::terminate())?,
        sighup: signal(SignalKind::hangup())?,
    })
}
