use btc_browser::config::{Args, Config};
use btc_browser::render::{TITLE, render_dashboard};
use btc_browser::store::open_data_dir;
use btc_browser::theme::{Theme, ThemeSettings};
use btc_browser::{ExplorerClient, SyncState, SyncStore};
use clap::Parser;
use std::sync::Arc;
use colored::*;
use figlet_rs::FIGfont;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn print_banner() {
    let figure = FIGfont::standard()
        .ok()
        .and_then(|font| font.convert("BTC Browser").map(|f| f.to_string()));

    println!("{}", "═══════════════════════════════════════════════════════════════════".bright_yellow());
    match figure {
        Some(figure) => println!("{}", figure.to_string().truecolor(247, 147, 26).bold()),
        None => println!("{}", TITLE.truecolor(247, 147, 26).bold()),
    }
    println!("{}", "═══════════════════════════════════════════════════════════════════".bright_yellow());
    println!("{}", "Latest block and its predecessor, polled from a block explorer".bright_white());
    println!();
}

/// Prints the dashboard, flagging a block id we have not printed before.
fn show(state: &SyncState, theme: Theme, last_id: &mut Option<String>, clear: bool) {
    let current_id = state.block.as_ref().map(|b| b.id.clone());
    let highlight = current_id.is_some() && current_id != *last_id;
    if clear {
        print!("\x1B[2J\x1B[H");
    }
    println!("{}", render_dashboard(state, theme, highlight));
    *last_id = current_id;
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    if !args.no_banner {
        print_banner();
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"))
        .add_directive("reqwest=warn".parse()?)
        .add_directive("hyper=warn".parse()?)
        .add_directive("hyper_util=warn".parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_args(&args)?;

    let storage = open_data_dir(&config.data_dir);
    let mut settings = ThemeSettings::load(Arc::clone(&storage));
    if let Some(theme) = args.theme {
        settings.set(theme);
    } else if args.toggle_theme {
        settings.toggle();
    }
    let theme = settings.theme();

    let client = ExplorerClient::new(&config.api_base)?.with_timeout(config.timeout);
    info!("using explorer at {}", client.base());
    let store = SyncStore::new(client, storage);
    let mut updates = store.subscribe();
    let mut last_id = None;

    store.refresh().await;
    let state = updates.borrow_and_update().clone();

    if args.once {
        show(&state, theme, &mut last_id, false);
        return match state.error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        };
    }

    show(&state, theme, &mut last_id, true);
    store.start_polling(config.poll_interval);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = updates.borrow_and_update().clone();
                // only redraw settled states
                if !state.loading {
                    show(&state, theme, &mut last_id, true);
                }
            }
            _ = &mut shutdown => {
                info!("shutting down");
                break;
            }
        }
    }

    store.stop_polling();
    Ok(())
}
