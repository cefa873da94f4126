//! Wiring of the proxy's components

use std::sync::Arc;

use color_eyre::eyre::{self, eyre, WrapErr};
use lessor_api::{Client, DEFAULT_USER_AGENT};
use lessor_axum::{AutoAuthToken, ProxyState};
use lessor_cache::{
    persist::read_service_account_aad, ApiProxy, ApiProxyConfig, CapabilityRefreshConfig,
    LeaseCache, LeaseCacheConfig, PersistentStorage, Proxier,
};
use lessor_tokens::{
    backoff::ErrorBackoffConfig,
    methods::{ConstAuthMethod, TokenFileMethod},
    AuthConfig, AuthHandler, AuthMethod, LoginRequest, Token,
};
use tokio::{net::TcpListener, sync::mpsc};
use tokio_util::sync::CancellationToken;

use crate::config::{AutoAuthConfig, CacheConfig, Config, MethodConfig, UpstreamConfig};

/// Runs the proxy until it is interrupted or its work is done
///
/// `stop` is cancelled by whatever ends the process: a signal, auto-auth
/// giving up, or the first token when exiting after auth. Background work
/// observes `shutdown`, which is only cancelled once the cache knows it is
/// shutting down, so cached entries survive on disk.
pub async fn run(config: Config) -> eyre::Result<()> {
    let stop = CancellationToken::new();
    let shutdown = CancellationToken::new();

    let client = upstream_client(&config.upstream)?;
    let api: Arc<dyn Proxier> = Arc::new(ApiProxy::new(
        client.clone(),
        ApiProxyConfig {
            enforce_consistency: config.api_proxy.enforce_consistency,
            when_inconsistent: config.api_proxy.when_inconsistent,
            prepend_configured_namespace: config.api_proxy.prepend_configured_namespace,
            ..ApiProxyConfig::default()
        },
    ));

    let (cache, restored_token) = match &config.cache {
        Some(cache_config) => {
            let (cache, token) =
                build_cache(cache_config, client.clone(), api.clone(), shutdown.clone())?;
            (Some(cache), token)
        }
        None => (None, None),
    };

    let proxier: Arc<dyn Proxier> = match &cache {
        Some(cache) => Arc::new(cache.clone()),
        None => api,
    };
    let mut state = ProxyState::new(proxier);
    if let Some(cache) = &cache {
        state = state.with_cache(cache.clone());
    }

    let mut auth_task = None;
    if let Some(auto_auth) = &config.auto_auth {
        let (handler, outputs) =
            AuthHandler::new(auth_client(&client)?, auth_config(auto_auth, restored_token));
        let method = auth_method(&auto_auth.method)?;

        let holder = AutoAuthToken::new();
        state = state.with_auto_auth(
            holder.clone(),
            config.use_auto_auth(),
            Some(outputs.invalid_token),
        );

        tokio::spawn(distribute_tokens(
            outputs.tokens,
            holder,
            cache.clone(),
            !auto_auth.method.wrap_ttl.is_zero(),
            config.exit_after_auth,
            stop.clone(),
        ));

        let (stop, shutdown) = (stop.clone(), shutdown.clone());
        auth_task = Some(tokio::spawn(async move {
            let result = handler.run(method.as_ref(), shutdown).await;
            if let Err(error) = &result {
                tracing::error!(error = error as &dyn std::error::Error, "auto-auth stopped");
                stop.cancel();
            }
            result
        }));
    }

    let listener = TcpListener::bind(config.listener.address)
        .await
        .wrap_err_with(|| format!("failed to listen on {}", config.listener.address))?;
    tracing::info!(
        address = %config.listener.address,
        upstream = %client.address(),
        cache = cache.is_some(),
        auto_auth = config.auto_auth.is_some(),
        "proxy listening"
    );

    axum::serve(listener, lessor_axum::router(state))
        .with_graceful_shutdown(wait_for_stop(stop))
        .await
        .wrap_err("proxy server failed")?;

    tracing::info!("shutting down");
    if let Some(cache) = &cache {
        cache.set_shutting_down(true).await;
    }
    shutdown.cancel();

    if let Some(task) = auth_task {
        task.await
            .wrap_err("auto-auth task panicked")?
            .wrap_err("auto-auth failed")?;
    }

    Ok(())
}

fn upstream_client(config: &UpstreamConfig) -> eyre::Result<Client> {
    let address = config
        .address
        .parse()
        .wrap_err_with(|| format!("invalid upstream address `{}`", config.address))?;

    let mut client = Client::new(address)?;
    if !config.namespace.is_empty() {
        client.set_namespace(&config.namespace)?;
    }
    Ok(client)
}

fn auth_client(client: &Client) -> eyre::Result<Client> {
    let mut client = client.clone();
    client.set_user_agent(&format!("{}; auto-auth", DEFAULT_USER_AGENT))?;
    Ok(client)
}

fn auth_config(config: &AutoAuthConfig, restored_token: Option<Token>) -> AuthConfig {
    let mut backoff = ErrorBackoffConfig::new(config.min_backoff, config.max_backoff);
    if config.exit_on_err {
        backoff = backoff.exit_on_error();
    }

    let method = &config.method;
    AuthConfig {
        backoff,
        token: restored_token,
        wrap_ttl: Some(method.wrap_ttl).filter(|ttl| !ttl.is_zero()),
        namespace: Some(method.namespace.clone()).filter(|ns| !ns.is_empty()),
        enable_reauth_on_new_credentials: config.enable_reauth_on_new_credentials,
        ..AuthConfig::default()
    }
}

/// Builds the configured auth method
///
/// `token_file` reads an existing token. Any other type logs in once at
/// `<mount>/login` with the method's `config` table as the request body.
fn auth_method(config: &MethodConfig) -> eyre::Result<Arc<dyn AuthMethod>> {
    if config.kind == "token_file" {
        let path = config
            .token_file_path()
            .ok_or_else(|| eyre!("the token_file method requires config.token_file_path"))?;
        let method = TokenFileMethod::new(path).with_mount_path(config.mount_path.as_str());
        return Ok(Arc::new(method));
    }

    let body = serde_json::to_value(&config.config)
        .wrap_err_with(|| format!("invalid config for auth method `{}`", config.kind))?;
    Ok(Arc::new(ConstAuthMethod::new(LoginRequest::new(
        config.login_path(),
        body,
    ))))
}

/// Builds the lease cache, restoring or attaching persistent storage
///
/// Returns the auto-auth token found in restored storage, if any.
fn build_cache(
    config: &CacheConfig,
    client: Client,
    api: Arc<dyn Proxier>,
    shutdown: CancellationToken,
) -> eyre::Result<(LeaseCache, Option<Token>)> {
    let mut lease_config = LeaseCacheConfig::new(client, api);
    lease_config.shutdown = shutdown;
    lease_config.cache_static_secrets = config.cache_static_secrets;
    lease_config.cache_dynamic_secrets = !config.disable_caching_dynamic_secrets;
    lease_config.capability_refresh = CapabilityRefreshConfig {
        interval: config.static_secret_token_capability_refresh_interval,
        behaviour: config.static_secret_token_capability_refresh_behaviour,
        ..CapabilityRefreshConfig::default()
    };

    let Some(persist) = &config.persist else {
        return Ok((LeaseCache::new(lease_config), None));
    };

    let aad = read_service_account_aad(&persist.service_account_token_file).wrap_err_with(|| {
        format!(
            "failed to read service account token {}",
            persist.service_account_token_file.display()
        )
    })?;

    if !PersistentStorage::exists(&persist.path) {
        let storage = PersistentStorage::create(&persist.path, aad)
            .wrap_err("failed to create persistent cache")?;
        tracing::info!(path = %persist.path.display(), "created persistent cache");
        lease_config.storage = Some(Arc::new(storage));
        return Ok((LeaseCache::new(lease_config), None));
    }

    let storage =
        Arc::new(PersistentStorage::open(&persist.path, aad).wrap_err("failed to open persistent cache")?);
    if persist.keep_after_import {
        lease_config.storage = Some(storage.clone());
    }
    let cache = LeaseCache::new(lease_config);

    if let Err(errors) = cache.restore(&storage) {
        if persist.exit_on_err {
            return Err(eyre::Report::new(errors).wrap_err("failed to restore persistent cache"));
        }
        tracing::warn!(%errors, "restored persistent cache with errors");
    }

    let token = storage
        .get_auto_auth_token()
        .wrap_err("failed to read auto-auth token from persistent cache")?
        .map(Token::new);

    if !persist.keep_after_import {
        match Arc::try_unwrap(storage) {
            Ok(storage) => storage.close()?,
            Err(_) => tracing::warn!("persistent cache is still in use and was not closed"),
        }
        PersistentStorage::remove(&persist.path).wrap_err("failed to remove persistent cache")?;
        tracing::info!(path = %persist.path.display(), "removed persistent cache after import");
    }

    Ok((cache, token))
}

/// Hands each new auto-auth token to the handler and the cache
async fn distribute_tokens(
    mut tokens: mpsc::Receiver<Token>,
    holder: AutoAuthToken,
    cache: Option<LeaseCache>,
    wrapped: bool,
    exit_after_auth: bool,
    stop: CancellationToken,
) {
    while let Some(token) = tokens.recv().await {
        if wrapped {
            tracing::info!("received response-wrapped token");
        } else {
            if let Some(cache) = &cache {
                if let Err(error) = cache.register_auto_auth_token(token.as_str()) {
                    tracing::warn!(
                        error = &error as &dyn std::error::Error,
                        "failed to register auto-auth token with the cache"
                    );
                }
            }
            holder.set(token);
        }

        if exit_after_auth {
            tracing::info!("authenticated; exiting");
            stop.cancel();
            break;
        }
    }
}

async fn wait_for_stop(stop: CancellationToken) {
    let interrupt = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::warn!(%error, "failed to listen for interrupts");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(error) => {
                tracing::warn!(%error, "failed to listen for termination");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => tracing::info!("received interrupt"),
        _ = terminate => tracing::info!("received termination signal"),
        _ = stop.cancelled() => {}
    }

    stop.cancel();
}
