use std::io;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use onvif::events::{ItemSet, PropertyOperation, SubscriptionPolicy};
use onvif::{
    CallContext, CancelToken, Client, ClientConfig, Credentials, EventServer, NotificationMessage,
    ServerConfig, SubscriptionManager,
};

#[derive(Parser)]
#[command(
    name = "onvif-events",
    about = "Pull-point event watcher and reference event source"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the reference event server and publish a synthetic motion event periodically
    Serve(ServeArgs),
    /// Subscribe to a device's events and print them as they arrive
    Watch(WatchArgs),
}

#[derive(Args)]
struct Auth {
    /// Account name; omit to run without authentication
    #[arg(long, short)]
    username: Option<String>,

    #[arg(long, short, default_value = "")]
    password: String,
}

impl Auth {
    fn credentials(&self) -> Option<Credentials> {
        self.username
            .as_ref()
            .map(|u| Credentials::new(u.as_str(), self.password.as_str()))
    }
}

#[derive(Args)]
struct ServeArgs {
    /// Bind address (host:port)
    #[arg(long, short, default_value = "0.0.0.0:8080")]
    bind: String,

    /// Host advertised in subscription references (defaults to the request's Host header)
    #[arg(long)]
    public_host: Option<String>,

    /// Seconds between synthetic motion events; 0 disables them
    #[arg(long, default_value_t = 5)]
    interval: u64,

    #[command(flatten)]
    auth: Auth,
}

#[derive(Args)]
struct WatchArgs {
    /// Event service URL, e.g. http://192.168.1.10/onvif/events
    url: String,

    /// ConcreteSet topic filter, e.g. tns1:VideoSource/MotionAlarm
    #[arg(long, short, default_value = "")]
    filter: String,

    /// Requested subscription lifetime in seconds; renewed at half-life
    #[arg(long, default_value_t = 60)]
    termination: u64,

    /// Seconds each pull may wait on the device
    #[arg(long, default_value_t = 10)]
    pull_timeout: u64,

    /// Maximum messages per pull
    #[arg(long, default_value_t = 10)]
    limit: u32,

    /// Skip the initial property snapshot
    #[arg(long)]
    changed_only: bool,

    /// Exit after this many messages
    #[arg(long)]
    count: Option<usize>,

    #[command(flatten)]
    auth: Auth,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let result = match Cli::parse().command {
        Command::Serve(args) => serve(args),
        Command::Watch(args) => watch(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn serve(args: ServeArgs) -> onvif::Result<()> {
    let config = ServerConfig {
        public_host: args.public_host,
        credentials: args.auth.credentials(),
        ..ServerConfig::default()
    };
    let mut server = EventServer::with_config(&args.bind, config);
    server.start()?;

    let publishing = Arc::new(AtomicBool::new(true));
    let publisher = (args.interval > 0).then(|| {
        let registry = server.registry().clone();
        let publishing = publishing.clone();
        let interval = Duration::from_secs(args.interval);
        thread::spawn(move || {
            let mut state = false;
            while publishing.load(Ordering::SeqCst) {
                thread::sleep(interval);
                state = !state;
                let delivered = registry.publish(synthetic_motion(state), Utc::now());
                tracing::info!(state, delivered, "published synthetic motion event");
            }
        })
    });

    println!(
        "event service at {}, press Enter to stop",
        server.events_url()?
    );
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;

    publishing.store(false, Ordering::SeqCst);
    server.stop();
    if let Some(publisher) = publisher {
        let _ = publisher.join();
    }
    Ok(())
}

fn synthetic_motion(state: bool) -> NotificationMessage {
    NotificationMessage::new("tns1:VideoSource/MotionAlarm", Utc::now())
        .with_operation(PropertyOperation::Changed)
        .with_source(ItemSet::new().with("Source", "VideoSource_1"))
        .with_data(ItemSet::new().with("State", state.to_string()))
}

fn watch(args: WatchArgs) -> onvif::Result<()> {
    let config = ClientConfig {
        credentials: args.auth.credentials(),
        ..ClientConfig::default()
    };
    let events = SubscriptionManager::new(Client::new(config)?, args.url.as_str());

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        thread::spawn(move || {
            let mut input = String::new();
            let _ = io::stdin().read_line(&mut input);
            cancel.cancel();
        });
    }
    let ctx = CallContext::new().with_cancel(cancel);

    let termination = Duration::from_secs(args.termination);
    let policy = SubscriptionPolicy {
        changed_only: args.changed_only,
    };
    let mut sub = events.create(&ctx, &args.filter, termination, &policy)?;
    println!(
        "subscribed: {} (until {}), press Enter to stop",
        sub.reference(),
        sub.termination_time()
    );

    let mut seen = 0usize;
    let outcome = loop {
        if args.count.is_some_and(|n| seen >= n) {
            break Ok(());
        }

        if sub.remaining_at(sub.current_time()) < termination / 2 {
            if let Err(e) = events.renew_subscription(&ctx, &mut sub, termination) {
                break Err(e);
            }
            tracing::info!(until = %sub.termination_time(), "renewed");
        }

        match events.pull_subscription(
            &ctx,
            &mut sub,
            Duration::from_secs(args.pull_timeout),
            args.limit,
        ) {
            Ok(messages) => {
                for message in &messages {
                    print_message(message);
                }
                seen += messages.len();
            }
            Err(e) => break Err(e),
        }
    };

    // Best effort: the subscription expires on its own if this fails.
    if let Err(e) = events.unsubscribe_subscription(&CallContext::new(), &mut sub) {
        tracing::warn!(error = %e, "unsubscribe failed");
    }

    match outcome {
        Err(e) if e.is_cancelled() => Ok(()),
        other => other,
    }
}

fn print_message(message: &NotificationMessage) {
    let items = |set: &ItemSet| {
        set.iter()
            .map(|(n, v)| format!("{n}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    };
    println!(
        "{} {} {} source[{}] data[{}]",
        message.utc_time().to_rfc3339(),
        message.topic(),
        message
            .property_operation()
            .map_or("-", |op| op.as_str()),
        items(message.source()),
        items(message.data()),
    );
}
