use bmslink::{BleTransport, Session, SessionState};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let transport = Arc::new(BleTransport::new().await?);
    let session = Session::spawn(transport);

    // Scan, then connect to the first named device that shows up.
    session.start_scan();
    let mut snapshots = session.subscribe();
    let device = loop {
        snapshots.changed().await?;
        if let Some(device) = snapshots.borrow().discovered.first().cloned() {
            break device;
        }
    };
    println!("connecting to {} ({})", device.name, device.id);
    session.select_device(device.id);

    loop {
        snapshots.changed().await?;
        let snapshot = snapshots.borrow().clone();
        match snapshot.state {
            SessionState::Ready => {
                let battery = &snapshot.battery;
                println!(
                    "{:.2}V {:.2}A {:.1}% ({} strings, diff {:.3}V)",
                    battery.total_voltage,
                    battery.current,
                    battery.charge_percentage(),
                    battery.total_strings,
                    battery.voltage_diff,
                );
            }
            SessionState::Disconnected { error } => {
                if let Some(error) = error {
                    anyhow::bail!("disconnected: {error}");
                }
                println!("disconnected");
                return Ok(());
            }
            _ => {}
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}
