use std::error::Error;
use std::process::ExitCode;
use std::time::Duration;

use eliot_desk::transport::ble::BleTransport;
use eliot_desk::{DeskEvent, DeskSession};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(1)
        }
    }
}

async fn run() -> Result<(), Box<dyn Error>> {
    let mut args = std::env::args().skip(1);
    let (Some(address), Some(command)) = (args.next(), args.next()) else {
        print_usage();
        return Ok(());
    };

    let desk = DeskSession::new(BleTransport::new().await?, address);
    let mut events = desk.subscribe_events();
    desk.connect().await?;

    match command.as_str() {
        "status" => {}
        "up" => desk.move_up().await?,
        "down" => desk.move_down().await?,
        "stop" => desk.stop().await?,
        "sit" => desk.move_to_sit_preset().await?,
        "stand" => desk.move_to_stand_preset().await?,
        "lock" => desk.lock().await?,
        "unlock" => desk.unlock().await?,
        "save-sit" => desk.save_sit_preset().await?,
        "save-stand" => desk.save_stand_preset().await?,
        "set" => {
            let Some(target) = args.next() else {
                print_usage();
                return Ok(());
            };
            desk.set_height(target.parse()?).await?;
        }
        "watch" => {
            let seconds = args.next().map(|s| s.parse()).transpose()?.unwrap_or(30);
            let deadline = tokio::time::sleep(Duration::from_secs(seconds));
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    event = events.recv() => match event? {
                        DeskEvent::HeightChanged(height_mm) => println!("height: {height_mm} mm"),
                        DeskEvent::LockChanged(locked) => println!("locked: {locked}"),
                    },
                }
            }
        }
        _ => {
            print_usage();
            return Ok(());
        }
    }

    let state = desk.refresh().await?;
    match state.height_mm {
        Some(height_mm) => println!("Height: {height_mm} mm"),
        None => println!("Height: unknown"),
    }
    match state.locked {
        Some(locked) => println!("Locked: {locked}"),
        None => println!("Locked: unknown"),
    }

    desk.disconnect().await?;
    Ok(())
}

fn print_usage() {
    println!("Usage:");
    println!("  cargo run --example desk_probe -- <ADDRESS> <COMMAND>");
    println!();
    println!("Commands:");
    println!("  status | up | down | stop | sit | stand | lock | unlock");
    println!("  save-sit | save-stand | set <MM> | watch [SECONDS]");
}
