//! Admin web panel: login, dashboard, batch upload and login settings.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Json, Router,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::{self, Config};
use crate::credentials::Tier;
use crate::dispenser::{Dispenser, Overview};
use crate::error::StorageError;
use crate::password;
use crate::stats::Counter;

const SESSION_COOKIE: &str = "dispenser_session";
const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum WebError {
    #[error("login required")]
    Unauthenticated,

    #[error("{0}")]
    BadRequest(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebError::Unauthenticated => return Redirect::to("/login").into_response(),
            WebError::BadRequest(_) => StatusCode::BAD_REQUEST,
            WebError::Storage(e) => {
                warn!("storage failure on {}: {}", e.path().display(), e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
            WebError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = format!(
            "<!DOCTYPE html><html><body><h1>{}</h1><p>{}</p><a href=\"/dashboard\">Back</a></body></html>",
            status.as_u16(),
            escape(&self.to_string())
        );
        (status, Html(body)).into_response()
    }
}

type WebResult<T> = std::result::Result<T, WebError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlashKind {
    Success,
    Error,
}

#[derive(Debug, Clone)]
struct Flash {
    kind: FlashKind,
    message: String,
}

struct Session {
    expires_at: DateTime<Utc>,
    flash: Option<Flash>,
}

pub struct WebState {
    config_path: PathBuf,
    cfg: RwLock<Config>,
    dispenser: Arc<Dispenser>,
    sessions: DashMap<String, Session>,
}

impl WebState {
    pub fn new(config_path: PathBuf, cfg: Config, dispenser: Arc<Dispenser>) -> Self {
        Self {
            config_path,
            cfg: RwLock::new(cfg),
            dispenser,
            sessions: DashMap::new(),
        }
    }

    fn create_session(&self, ttl: chrono::Duration) -> String {
        let now = Utc::now();
        self.sessions.retain(|_, s| s.expires_at > now);

        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        let token = hex::encode(raw);
        self.sessions.insert(
            token.clone(),
            Session {
                expires_at: now + ttl,
                flash: None,
            },
        );
        token
    }

    /// The caller's live session token.
    fn authenticate(&self, headers: &HeaderMap) -> WebResult<String> {
        let token = session_cookie(headers).ok_or(WebError::Unauthenticated)?;
        let now = Utc::now();
        let live = self
            .sessions
            .get(&token)
            .is_some_and(|s| s.expires_at > now);
        if !live {
            self.sessions.remove(&token);
            return Err(WebError::Unauthenticated);
        }
        Ok(token)
    }

    fn set_flash(&self, token: &str, kind: FlashKind, message: impl Into<String>) {
        if let Some(mut s) = self.sessions.get_mut(token) {
            s.flash = Some(Flash {
                kind,
                message: message.into(),
            });
        }
    }

    fn take_flash(&self, token: &str) -> Option<Flash> {
        self.sessions.get_mut(token).and_then(|mut s| s.flash.take())
    }

    async fn with_dispenser<T, F>(&self, f: F) -> WebResult<T>
    where
        F: FnOnce(&Dispenser) -> T + Send + 'static,
        T: Send + 'static,
    {
        let d = self.dispenser.clone();
        tokio::task::spawn_blocking(move || f(&d))
            .await
            .map_err(|e| WebError::Internal(e.to_string()))
    }
}

fn session_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.to_string())
        .filter(|v| !v.is_empty())
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn layout(app_title: &str, page: &str, flash: Option<&Flash>, nav: bool, body: &str) -> String {
    let nav_html = if nav {
        "<nav>\
         <a href=\"/dashboard\">Dashboard</a> | \
         <a href=\"/accounts\">Account Management</a> | \
         <a href=\"/settings\">Settings</a> | \
         <a href=\"/logout\">Logout</a>\
         </nav>"
    } else {
        ""
    };
    let flash_html = flash
        .map(|f| {
            let class = match f.kind {
                FlashKind::Success => "flash success",
                FlashKind::Error => "flash error",
            };
            format!("<div class=\"{class}\">{}</div>", escape(&f.message))
        })
        .unwrap_or_default();
    format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"UTF-8\">\n\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1.0\">\n\
         <title>{page} - {app}</title>\n\
         <style>body{{font-family:sans-serif;background:#111827;color:#f3f4f6;margin:2rem}}\
         a{{color:#93c5fd}}table{{border-collapse:collapse}}td,th{{padding:.3rem .8rem;border:1px solid #374151}}\
         .flash{{padding:.8rem;margin:1rem 0}}.success{{background:#065f46}}.error{{background:#991b1b}}</style>\n\
         </head>\n<body>\n<h1>{app}</h1>\n{nav_html}\n{flash_html}\n{body}\n</body>\n</html>\n",
        page = escape(page),
        app = escape(app_title),
    )
}

fn login_body() -> &'static str {
    "<h2>Admin Login</h2>\
     <form method=\"POST\" action=\"/login\">\
     <p><label>Username <input type=\"text\" name=\"username\" required></label></p>\
     <p><label>Password <input type=\"password\" name=\"password\" required></label></p>\
     <button type=\"submit\">Login</button>\
     </form>"
}

fn dashboard_body(o: &Overview) -> String {
    let mut rows = String::new();
    for (service, c) in &o.availability.services {
        rows.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
            escape(service),
            c.free,
            c.premium,
            c.free + c.premium
        ));
    }
    if rows.is_empty() {
        rows.push_str("<tr><td colspan=\"4\">No accounts available</td></tr>");
    }
    format!(
        "<h2>Dashboard</h2>\
         <ul>\
         <li>Free Accounts: <b>{}</b></li>\
         <li>Premium Accounts: <b>{}</b></li>\
         <li>Free Generated: <b>{}</b></li>\
         <li>Premium Generated: <b>{}</b></li>\
         <li>Accounts Added: <b>{}</b></li>\
         </ul>\
         <h3>Services</h3>\
         <table><tr><th>Service</th><th>Free</th><th>Premium</th><th>Total</th></tr>\
         {rows}</table>",
        o.availability.totals.free,
        o.availability.totals.premium,
        o.stats.get(Counter::FreeGenerated),
        o.stats.get(Counter::PremiumGenerated),
        o.stats.get(Counter::AccountsAdded),
    )
}

fn accounts_body(o: &Overview) -> String {
    let tier_list = |tier: Tier| {
        let services = o.availability.for_tier(tier);
        if services.is_empty() {
            return format!("<p>No {tier} accounts available</p>");
        }
        let items: String = services
            .iter()
            .map(|(s, n)| format!("<li>{}: {}</li>", escape(s), n))
            .collect();
        format!("<ul>{items}</ul>")
    };
    format!(
        "<h2>Account Management</h2>\
         <h3>Upload Accounts</h3>\
         <form method=\"POST\" action=\"/upload-accounts\" enctype=\"multipart/form-data\">\
         <p><label>Account Type <select name=\"account_type\">\
         <option value=\"free\">Free</option><option value=\"premium\">Premium</option>\
         </select></label></p>\
         <p><label>Service <input type=\"text\" name=\"service\" required></label></p>\
         <p><label>Accounts File (.txt, one per line) <input type=\"file\" name=\"accounts\" accept=\".txt\" required></label></p>\
         <button type=\"submit\">Upload Accounts</button>\
         </form>\
         <h3>Free Services</h3>{}\
         <h3>Premium Services</h3>{}",
        tier_list(Tier::Free),
        tier_list(Tier::Premium),
    )
}

fn settings_body(cfg: &Config) -> String {
    format!(
        "<h2>Settings</h2>\
         <form method=\"POST\" action=\"/update-web-settings\">\
         <p><label>Username <input type=\"text\" name=\"web_username\" value=\"{}\" required></label></p>\
         <p><label>New Password (leave blank to keep) <input type=\"password\" name=\"web_password\"></label></p>\
         <button type=\"submit\">Save Settings</button>\
         </form>\
         <h3>Cooldowns</h3>\
         <ul><li>Free: {}s</li><li>Premium: {}s</li></ul>",
        escape(&cfg.web.username),
        cfg.cooldown.free,
        cfg.cooldown.premium,
    )
}

async fn render(state: &WebState, token: &str, page: &str, body: &str) -> Html<String> {
    let flash = state.take_flash(token);
    let cfg = state.cfg.read().await;
    Html(layout(cfg.title(), page, flash.as_ref(), true, body))
}

async fn index(State(state): State<Arc<WebState>>, headers: HeaderMap) -> Redirect {
    match state.authenticate(&headers) {
        Ok(_) => Redirect::to("/dashboard"),
        Err(_) => Redirect::to("/login"),
    }
}

async fn login_page(State(state): State<Arc<WebState>>, headers: HeaderMap) -> Response {
    if state.authenticate(&headers).is_ok() {
        return Redirect::to("/dashboard").into_response();
    }
    let cfg = state.cfg.read().await;
    Html(layout(cfg.title(), "Login", None, false, login_body())).into_response()
}

#[derive(Deserialize)]
struct LoginForm {
    username: String,
    password: String,
}

async fn login_submit(
    State(state): State<Arc<WebState>>,
    Form(form): Form<LoginForm>,
) -> WebResult<Response> {
    let (title, username, hash, ttl) = {
        let cfg = state.cfg.read().await;
        (
            cfg.title().to_string(),
            cfg.web.username.clone(),
            cfg.web.password_hash.clone(),
            cfg.session_ttl(),
        )
    };

    let failed = |message: &str| {
        let flash = Flash {
            kind: FlashKind::Error,
            message: message.to_string(),
        };
        (
            StatusCode::UNAUTHORIZED,
            Html(layout(&title, "Login", Some(&flash), false, login_body())),
        )
            .into_response()
    };

    let Some(hash) = hash else {
        warn!("login refused: web.password_hash is not configured");
        return Ok(failed(
            "Web login is disabled until web.password_hash is set \
             (tg-dispenser hash-password <password>)",
        ));
    };

    let password = form.password;
    let password_ok =
        tokio::task::spawn_blocking(move || password::verify_password(&password, &hash))
            .await
            .map_err(|e| WebError::Internal(e.to_string()))?;

    if form.username != username || !password_ok {
        warn!("failed web login for user '{}'", form.username);
        return Ok(failed("Invalid username or password"));
    }

    info!("web login: {}", form.username);
    let token = state.create_session(ttl);
    let cookie = format!(
        "{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        ttl.num_seconds()
    );
    let mut resp = Redirect::to("/dashboard").into_response();
    let value = HeaderValue::from_str(&cookie).map_err(|e| WebError::Internal(e.to_string()))?;
    resp.headers_mut().insert(header::SET_COOKIE, value);
    Ok(resp)
}

async fn logout(State(state): State<Arc<WebState>>, headers: HeaderMap) -> Response {
    if let Some(token) = session_cookie(&headers) {
        state.sessions.remove(&token);
    }
    let mut resp = Redirect::to("/login").into_response();
    resp.headers_mut().insert(
        header::SET_COOKIE,
        HeaderValue::from_static("dispenser_session=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0"),
    );
    resp
}

async fn dashboard(
    State(state): State<Arc<WebState>>,
    headers: HeaderMap,
) -> WebResult<Html<String>> {
    let token = state.authenticate(&headers)?;
    let overview = state.with_dispenser(|d| d.overview()).await??;
    Ok(render(&state, &token, "Dashboard", &dashboard_body(&overview)).await)
}

async fn accounts(
    State(state): State<Arc<WebState>>,
    headers: HeaderMap,
) -> WebResult<Html<String>> {
    let token = state.authenticate(&headers)?;
    let overview = state.with_dispenser(|d| d.overview()).await??;
    Ok(render(&state, &token, "Account Management", &accounts_body(&overview)).await)
}

#[derive(Default)]
struct UploadForm {
    account_type: Option<String>,
    service: Option<String>,
    file_name: Option<String>,
    content: Option<Vec<u8>>,
}

async fn read_upload(mut multipart: Multipart) -> WebResult<UploadForm> {
    let mut form = UploadForm::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| WebError::BadRequest(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "account_type" | "service" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| WebError::BadRequest(e.to_string()))?;
                if name == "service" {
                    form.service = Some(value);
                } else {
                    form.account_type = Some(value);
                }
            }
            "accounts" => {
                form.file_name = field.file_name().map(str::to_string);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| WebError::BadRequest(e.to_string()))?;
                form.content = Some(bytes.to_vec());
            }
            _ => {}
        }
    }
    Ok(form)
}

async fn upload_accounts(
    State(state): State<Arc<WebState>>,
    headers: HeaderMap,
    multipart: Multipart,
) -> WebResult<Redirect> {
    let token = state.authenticate(&headers)?;
    let form = read_upload(multipart).await?;
    let back = Redirect::to("/accounts");

    let is_txt = form
        .file_name
        .as_deref()
        .is_some_and(|n| n.to_ascii_lowercase().ends_with(".txt"));
    let (Some(content), true) = (form.content, is_txt) else {
        state.set_flash(&token, FlashKind::Error, "Please upload a valid .txt file");
        return Ok(back);
    };
    let Some(Ok(tier)) = form.account_type.as_deref().map(str::parse::<Tier>) else {
        state.set_flash(&token, FlashKind::Error, "Account type must be either 'free' or 'premium'");
        return Ok(back);
    };
    let Ok(text) = String::from_utf8(content) else {
        state.set_flash(&token, FlashKind::Error, "The accounts file is not valid UTF-8");
        return Ok(back);
    };
    let service = form.service.unwrap_or_default();

    let svc = service.clone();
    match state
        .with_dispenser(move |d| d.upload_batch(tier, &svc, &text))
        .await?
    {
        Ok(added) => state.set_flash(
            &token,
            FlashKind::Success,
            format!("Successfully added {added} {tier} accounts for {}", service.trim()),
        ),
        Err(e) => {
            warn!("web upload failed: {:?}", e);
            let message = if e.downcast_ref::<StorageError>().is_some() {
                "An error occurred while processing the file".to_string()
            } else {
                e.to_string()
            };
            state.set_flash(&token, FlashKind::Error, message);
        }
    }
    Ok(back)
}

async fn settings(
    State(state): State<Arc<WebState>>,
    headers: HeaderMap,
) -> WebResult<Html<String>> {
    let token = state.authenticate(&headers)?;
    let body = settings_body(&*state.cfg.read().await);
    Ok(render(&state, &token, "Settings", &body).await)
}

#[derive(Deserialize)]
struct SettingsForm {
    web_username: String,
    #[serde(default)]
    web_password: String,
}

async fn update_web_settings(
    State(state): State<Arc<WebState>>,
    headers: HeaderMap,
    Form(form): Form<SettingsForm>,
) -> WebResult<Redirect> {
    let token = state.authenticate(&headers)?;
    let username = form.web_username.trim().to_string();
    if username.is_empty() {
        state.set_flash(&token, FlashKind::Error, "Username must not be empty");
        return Ok(Redirect::to("/settings"));
    }

    let path = state.config_path.clone();
    let lock_timeout = state.cfg.read().await.lock_timeout();
    let new_password = form.web_password;
    let saved = tokio::task::spawn_blocking(move || {
        let hash = (!new_password.is_empty()).then(|| password::hash_password(&new_password));
        config::save_web_credentials(&path, &username, hash.as_deref(), lock_timeout)
    })
    .await
    .map_err(|e| WebError::Internal(e.to_string()))?;

    match saved {
        Ok(updated) => {
            info!("web login settings updated (user '{}')", updated.web.username);
            let mut cfg = state.cfg.write().await;
            cfg.web = updated.web;
            state.set_flash(&token, FlashKind::Success, "Web panel settings updated successfully!");
        }
        Err(e) => {
            warn!("saving web settings failed: {:?}", e);
            state.set_flash(&token, FlashKind::Error, "Failed to save settings");
        }
    }
    Ok(Redirect::to("/settings"))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub fn router(state: Arc<WebState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/login", get(login_page).post(login_submit))
        .route("/logout", get(logout))
        .route("/dashboard", get(dashboard))
        .route("/accounts", get(accounts))
        .route("/upload-accounts", post(upload_accounts))
        .route("/settings", get(settings))
        .route("/update-web-settings", post(update_web_settings))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run(
    config_path: PathBuf,
    cfg: Config,
    dispenser: Arc<Dispenser>,
) -> anyhow::Result<()> {
    if cfg.web.password_hash.is_none() {
        warn!("web.password_hash is not set; logins will be refused until it is configured");
    }
    let addr = format!("{}:{}", cfg.web.host, cfg.web.port);
    let state = Arc::new(WebState::new(config_path, cfg, dispenser));
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Web panel listening on http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
