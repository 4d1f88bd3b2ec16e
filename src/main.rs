use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use moimate::api::auth::OAuthProvider;
use moimate::api::post::{LikeState, PostId};
use moimate::api::ApiClient;
use moimate::auth::{AuthSession, Tokens};
use moimate::bus::{Event, EventBus};
use moimate::config::Config;
use moimate::entity::{RoomId, RoomRole, UserId};
use moimate::interface::terminal::TerminalChat;
use moimate::notification::NotificationCenter;
use moimate::realtime::{RealtimeConfig, RealtimeHandle};
use moimate::room::ChatRoom;
use moimate::store::Store;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::{info, warn};

const DEFAULT_REDIRECT_URI: &str = "http://localhost:3000/oauth/callback";

#[derive(Parser)]
#[command(name = "moimate", version, about = "MoiMate meetup chat client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the chat rooms you belong to
    Rooms,
    /// Open a chat room
    Chat { room_id: RoomId },
    /// Browse recruiting posts
    Posts {
        #[arg(long, default_value_t = 0)]
        page: u32,
        #[arg(long)]
        keyword: Option<String>,
    },
    /// Toggle your like on a post
    Like { post_id: PostId },
    /// Show a profile with its reviews; defaults to your own
    Profile { user_id: Option<UserId> },
    /// List notifications and the unread count
    Notifications,
    /// Mark every notification read
    ReadAll,
    /// Store tokens obtained elsewhere
    Tokens { access: String, refresh: String },
    /// Log in with an OAuth authorization code; without a code, print the
    /// provider's authorization URL
    Login {
        provider: OAuthProvider,
        code: Option<String>,
        #[arg(long, default_value = DEFAULT_REDIRECT_URI)]
        redirect_uri: String,
    },
    Logout,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        info!("No .env file found or failed to load: {}", e);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    info!("Opening client state at {}", config.db_path.display());
    let store = Store::new(&config.db_path).await?;
    store.init().await?;

    let auth = AuthSession::restore(store.clone()).await?;
    let api = ApiClient::new(&config.api_url, config.http_timeout, auth.clone())?;
    let bus = Arc::new(EventBus::new());

    let mut tokens = auth.subscribe();
    let auth_bus = bus.clone();
    tokio::spawn(async move {
        while tokens.changed().await.is_ok() {
            let logged_in = tokens.borrow_and_update().is_some();
            auth_bus.publish(Event::AuthChanged { logged_in });
        }
    });

    // The chat front-end handles Ctrl+C itself so it can send DISCONNECT.
    if let Command::Chat { room_id } = cli.command {
        return chat(room_id, &config, store, auth, api, bus).await;
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            Ok(())
        }
        res = run(cli.command, &config, store, auth, api, bus) => res,
    }
}

async fn run(
    command: Command,
    config: &Config,
    store: Store,
    auth: AuthSession,
    api: ApiClient,
    bus: Arc<EventBus>,
) -> anyhow::Result<()> {
    match command {
        Command::Rooms => {
            for room in api.chat_rooms().await? {
                println!(
                    "{:>6}  {:<24} {:?}  unread {}  {}",
                    room.room_id,
                    room.title,
                    room.role,
                    room.unread_count,
                    room.last_message.unwrap_or_default()
                );
            }
        }
        Command::Chat { room_id } => chat(room_id, config, store, auth, api, bus).await?,
        Command::Posts { page, keyword } => {
            let posts = api.posts(page, 20, keyword.as_deref()).await?;
            for post in &posts.content {
                println!(
                    "{:>6}  {:<32} {}/{}  ♥ {}",
                    post.id, post.title, post.current_participants, post.max_participants, post.like_count
                );
            }
            println!("page {} of {}", page + 1, posts.total_pages.max(1));
        }
        Command::Like { post_id } => {
            let post = api.post(post_id).await?;
            let mut like = LikeState::of(&post);
            api.toggle_like(post_id, &mut like)
                .await
                .context("Like request failed; nothing changed")?;
            println!("liked: {}  likes: {}", like.liked, like.count);
        }
        Command::Profile { user_id } => {
            let user_id = match user_id {
                Some(id) => id,
                None => api.me().await.context("Failed to load profile")?.user_id,
            };
            let profile = api.profile(user_id).await?;
            println!("{} ({})", profile.nickname, profile.user_id);
            if let Some(intro) = &profile.introduction {
                println!("  {intro}");
            }
            for review in api.reviews(user_id).await? {
                println!("  {}/5  {}", review.score, review.comment);
            }
        }
        Command::Notifications => {
            let center = NotificationCenter::new(api.clone(), bus);
            for n in center.list().await? {
                println!(
                    "{} [{}] {}",
                    if n.is_read { " " } else { "*" },
                    n.kind.label(),
                    n.content
                );
            }
            println!("unread: {}", center.refresh_unread().await);
        }
        Command::ReadAll => {
            NotificationCenter::new(api.clone(), bus).read_all().await?;
            println!("All notifications marked read");
        }
        Command::Tokens { access, refresh } => {
            auth.set_tokens(Tokens {
                access,
                refresh: Some(refresh),
            })
            .await?;
            match api.me().await {
                Ok(me) => println!("Logged in as {me}"),
                Err(e) => warn!("Tokens stored but could not load profile: {}", e),
            }
        }
        Command::Login {
            provider,
            code,
            redirect_uri,
        } => match code {
            Some(code) => {
                let me = api.login(provider, &code, Some(&redirect_uri)).await?;
                println!("Logged in as {me}");
            }
            None => {
                let client_id = match provider {
                    OAuthProvider::Kakao => config.kakao_client_id.as_deref(),
                    OAuthProvider::Google => config.google_client_id.as_deref(),
                };
                let Some(client_id) = client_id else {
                    bail!("No client id configured for {}", provider.as_str());
                };
                println!("{}", provider.authorize_url(client_id, &redirect_uri)?);
            }
        },
        Command::Logout => {
            if let Err(e) = api.logout().await {
                warn!("Server logout failed: {}", e);
            }
            println!("Logged out");
        }
    }
    Ok(())
}

async fn chat(
    room_id: RoomId,
    config: &Config,
    store: Store,
    auth: AuthSession,
    api: ApiClient,
    bus: Arc<EventBus>,
) -> anyhow::Result<()> {
    if !auth.is_logged_in().await {
        bail!("Not logged in; run `moimate login` or `moimate tokens` first");
    }
    let me = match auth.identity().await {
        Some(me) => me,
        None => api.me().await.context("Failed to load profile")?,
    };

    let role = api
        .chat_rooms()
        .await?
        .into_iter()
        .find(|room| room.room_id == room_id)
        .map(|room| room.role)
        .unwrap_or(RoomRole::Member);

    let realtime = RealtimeHandle::connect(
        RealtimeConfig::new(config.ws_url.clone()),
        auth.clone(),
        bus.clone(),
    );

    let mut notifications = NotificationCenter::new(api.clone(), bus.clone());
    notifications.listen(&realtime, me.user_id).await?;
    notifications.refresh_unread().await;

    let room = ChatRoom::open(room_id, role, api, realtime, Some(store), bus)
        .await
        .with_context(|| format!("Failed to open room {room_id}"))?;

    TerminalChat::new(room, Some(notifications.watch_banner()))
        .run_until(BufReader::new(tokio::io::stdin()), tokio::signal::ctrl_c())
        .await
}
