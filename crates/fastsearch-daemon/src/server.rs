use anyhow::{Result, anyhow, bail};
use fastsearch_core::{DEFAULT_EMBEDDING_DIM, FastSearchConfig, unix_time_f64};
use fastsearch_models::{
    DefaultSlotLoader, EmbedderBackend, ModelManager, RerankerBackend,
};
use fastsearch_rpc::{
    ERR_METHOD_NOT_FOUND, ERR_PARSE, ERR_SERVER, FrameError, JsonRpcRequest, JsonRpcResponse,
    read_frame, write_frame,
};
use fastsearch_store::{ChunkInsert, HybridOptions, SearchDb, SearchHit};
use serde_json::{Value, json};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const DEFAULT_DB_PATH: &str = "fastsearch.db";

/// The request dispatcher: owns the model manager, the request counter, and
/// the shutdown flag. One instance serves every connection.
pub struct Daemon {
    config: RwLock<FastSearchConfig>,
    manager: ModelManager,
    started_at: f64,
    request_count: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
}

impl Daemon {
    pub fn new(config: FastSearchConfig) -> Arc<Self> {
        let manager = ModelManager::new(
            config.clone(),
            Box::new(DefaultSlotLoader::new(DEFAULT_EMBEDDING_DIM)),
        );
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            config: RwLock::new(config),
            manager,
            started_at: unix_time_f64(),
            request_count: AtomicU64::new(0),
            shutdown_tx,
        })
    }

    pub fn manager(&self) -> &ModelManager {
        &self.manager
    }

    /// Set the shutdown flag; the accept loop notices on its next
    /// iteration.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Accept connections until the shutdown flag is set, then drain
    /// in-flight handlers briefly and abort the stragglers.
    pub async fn serve(self: &Arc<Self>, listener: UnixListener) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut connections: JoinSet<()> = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        connections.spawn(self.clone().handle_connection(stream));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                _ = shutdown_rx.changed() => break,
            }
        }
        drop(listener);

        let drain = async {
            while connections.join_next().await.is_some() {}
        };
        if tokio::time::timeout(Duration::from_millis(500), drain)
            .await
            .is_err()
        {
            connections.abort_all();
        }
    }

    /// Sequential request/response pairs on one connection; responses go
    /// out in request order. A framing violation drops the connection, a
    /// handler error does not.
    async fn handle_connection(self: Arc<Self>, stream: UnixStream) {
        let (mut reader, mut writer) = stream.into_split();
        loop {
            match read_frame(&mut reader).await {
                Ok(Some(payload)) => {
                    let response = self.handle_request(&payload).await;
                    if let Err(e) = write_frame(&mut writer, &response).await {
                        debug!(error = %e, "response write failed, dropping connection");
                        break;
                    }
                }
                Ok(None) => break,
                Err(FrameError::TooLarge { len, max }) => {
                    warn!(len, max, "oversize frame, dropping connection");
                    break;
                }
                Err(e) => {
                    debug!(error = %e, "framing error, dropping connection");
                    break;
                }
            }
        }
    }

    /// Decode one JSON-RPC request and produce the serialized response.
    pub async fn handle_request(&self, payload: &[u8]) -> Vec<u8> {
        let request: JsonRpcRequest = match serde_json::from_slice(payload) {
            Ok(request) => request,
            Err(e) => {
                return encode_response(JsonRpcResponse::error(
                    Value::Null,
                    ERR_PARSE,
                    format!("Parse error: {e}"),
                ));
            }
        };
        self.request_count.fetch_add(1, Ordering::Relaxed);

        let id = request.id.clone();
        let params = if request.params.is_null() {
            json!({})
        } else {
            request.params
        };

        let result = match request.method.as_str() {
            "ping" => self.handle_ping(params).await,
            "status" => self.handle_status(params).await,
            "search" => self.handle_search(params).await,
            "embed" => self.handle_embed(params).await,
            "rerank" => self.handle_rerank(params).await,
            "index" => self.handle_index(params).await,
            "delete_source" => self.handle_delete_source(params).await,
            "stats" => self.handle_stats(params).await,
            "load_model" => self.handle_load_model(params).await,
            "unload_model" => self.handle_unload_model(params).await,
            "reload_config" => self.handle_reload_config(params).await,
            "shutdown" => self.handle_shutdown(params).await,
            method => {
                return encode_response(JsonRpcResponse::error(
                    id,
                    ERR_METHOD_NOT_FOUND,
                    format!("Method not found: {method}"),
                ));
            }
        };

        let response = match result {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(e) => {
                error!(method = %request.method, error = %format!("{e:#}"), "handler failed");
                JsonRpcResponse::error(id, ERR_SERVER, e.to_string())
            }
        };
        encode_response(response)
    }

    async fn handle_ping(&self, _params: Value) -> Result<Value> {
        Ok(json!({"pong": true, "timestamp": unix_time_f64()}))
    }

    async fn handle_status(&self, _params: Value) -> Result<Value> {
        let status = self.manager.get_status();
        let socket_path = self
            .config
            .read()
            .expect("config lock")
            .daemon
            .socket_path
            .clone();
        Ok(json!({
            "uptime_seconds": unix_time_f64() - self.started_at,
            "request_count": self.request_count.load(Ordering::Relaxed),
            "socket_path": socket_path,
            "loaded_models": status.loaded_models,
            "total_memory_mb": status.total_memory_mb,
            "max_memory_mb": status.max_memory_mb,
        }))
    }

    async fn handle_search(&self, params: Value) -> Result<Value> {
        let query = require_str(&params, "query")?;
        let db_path = opt_str(&params, "db_path").unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let limit = params.get("limit").and_then(Value::as_u64).unwrap_or(10) as usize;
        let mode = opt_str(&params, "mode").unwrap_or_else(|| "hybrid".to_string());
        let rerank = params
            .get("rerank")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !matches!(mode.as_str(), "hybrid" | "bm25" | "vector") {
            bail!("invalid 'mode' value: {mode}");
        }

        let embedder = self.manager.load_model("embedder").await?.handle.embedder()?;
        let reranker = if mode == "hybrid" && rerank {
            Some(self.manager.load_model("reranker").await?.handle.reranker()?)
        } else {
            None
        };

        let started = Instant::now();
        let search_mode = mode.clone();
        let search_query = query.clone();
        let hits = tokio::task::spawn_blocking(move || -> Result<Vec<SearchHit>> {
            let db = SearchDb::open(Path::new(&db_path), embedder.dimension())?;
            match search_mode.as_str() {
                "bm25" => Ok(db.search_bm25(&search_query, limit)?),
                "vector" => {
                    let embedding = embed_single(embedder.as_ref(), &search_query)?;
                    Ok(db.search_vector(&embedding, limit)?)
                }
                _ => {
                    let embedding = embed_single(embedder.as_ref(), &search_query)?;
                    match reranker {
                        Some(reranker) => {
                            let rerank_top_k = (limit * 3).min(30);
                            Ok(db.search_hybrid_reranked(
                                &search_query,
                                &embedding,
                                limit,
                                rerank_top_k,
                                reranker.as_ref(),
                            )?)
                        }
                        None => Ok(db.search_hybrid(
                            &search_query,
                            &embedding,
                            limit,
                            &HybridOptions::default(),
                        )?),
                    }
                }
            }
        })
        .await
        .map_err(|e| anyhow!("search task failed: {e}"))??;

        Ok(json!({
            "query": query,
            "mode": mode,
            "reranked": rerank,
            "search_time_ms": elapsed_ms(started),
            "results": hits,
        }))
    }

    async fn handle_embed(&self, params: Value) -> Result<Value> {
        let texts = require_string_array(&params, "texts")?;
        let embedder = self.manager.load_model("embedder").await?.handle.embedder()?;

        let started = Instant::now();
        let embeddings =
            tokio::task::spawn_blocking(move || embedder.embed(&texts))
                .await
                .map_err(|e| anyhow!("embed task failed: {e}"))??;

        Ok(json!({
            "count": embeddings.len(),
            "embeddings": embeddings,
            "embed_time_ms": elapsed_ms(started),
        }))
    }

    async fn handle_rerank(&self, params: Value) -> Result<Value> {
        let query = require_str(&params, "query")?;
        let documents = require_string_array(&params, "documents")?;
        let reranker = self.manager.load_model("reranker").await?.handle.reranker()?;

        let started = Instant::now();
        let pairs: Vec<(String, String)> = documents
            .iter()
            .map(|doc| (query.clone(), doc.clone()))
            .collect();
        let scores = tokio::task::spawn_blocking(move || reranker.predict(&pairs))
            .await
            .map_err(|e| anyhow!("rerank task failed: {e}"))??;

        let mut indexed: Vec<(usize, f32)> = scores.iter().copied().enumerate().collect();
        indexed.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        let ranked: Vec<Value> = indexed
            .into_iter()
            .map(|(index, score)| json!({"index": index, "score": score}))
            .collect();

        Ok(json!({
            "scores": scores,
            "ranked": ranked,
            "rerank_time_ms": elapsed_ms(started),
        }))
    }

    async fn handle_index(&self, params: Value) -> Result<Value> {
        let db_path = opt_str(&params, "db_path").unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let raw_items = params
            .get("items")
            .and_then(Value::as_array)
            .filter(|items| !items.is_empty())
            .ok_or_else(|| anyhow!("missing 'items' parameter"))?;

        let mut sources = Vec::with_capacity(raw_items.len());
        for (i, item) in raw_items.iter().enumerate() {
            let source = item
                .get("source")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("item {i}: missing 'source'"))?;
            let chunk_index = item
                .get("chunk_index")
                .and_then(Value::as_i64)
                .ok_or_else(|| anyhow!("item {i}: missing 'chunk_index'"))?;
            let content = item
                .get("content")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("item {i}: missing 'content'"))?;
            let metadata = item.get("metadata").cloned().unwrap_or_else(|| json!({}));
            sources.push((source.to_string(), chunk_index, content.to_string(), metadata));
        }

        let embedder = self.manager.load_model("embedder").await?.handle.embedder()?;
        let started = Instant::now();
        let ids = tokio::task::spawn_blocking(move || -> Result<Vec<i64>> {
            let texts: Vec<String> = sources.iter().map(|(_, _, content, _)| content.clone()).collect();
            let embeddings = embedder.embed(&texts)?;
            let items: Vec<ChunkInsert> = sources
                .into_iter()
                .zip(embeddings)
                .map(|((source, chunk_index, content, metadata), embedding)| ChunkInsert {
                    source,
                    chunk_index,
                    content,
                    embedding,
                    metadata,
                })
                .collect();
            let mut db = SearchDb::open(Path::new(&db_path), embedder.dimension())?;
            Ok(db.index_batch(&items)?)
        })
        .await
        .map_err(|e| anyhow!("index task failed: {e}"))??;

        Ok(json!({
            "indexed": ids.len(),
            "ids": ids,
            "index_time_ms": elapsed_ms(started),
        }))
    }

    async fn handle_delete_source(&self, params: Value) -> Result<Value> {
        let source = require_str(&params, "source")?;
        let db_path = opt_str(&params, "db_path").unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let deleted_source = source.clone();
        let deleted = tokio::task::spawn_blocking(move || -> Result<usize> {
            let mut db = SearchDb::open(Path::new(&db_path), DEFAULT_EMBEDDING_DIM)?;
            Ok(db.delete_source(&deleted_source)?)
        })
        .await
        .map_err(|e| anyhow!("delete task failed: {e}"))??;
        Ok(json!({"source": source, "deleted": deleted}))
    }

    async fn handle_stats(&self, params: Value) -> Result<Value> {
        let db_path = opt_str(&params, "db_path").unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let stats = tokio::task::spawn_blocking(move || -> Result<_> {
            let db = SearchDb::open(Path::new(&db_path), DEFAULT_EMBEDDING_DIM)?;
            Ok(db.get_stats()?)
        })
        .await
        .map_err(|e| anyhow!("stats task failed: {e}"))??;
        Ok(serde_json::to_value(stats)?)
    }

    async fn handle_load_model(&self, params: Value) -> Result<Value> {
        let slot = require_str(&params, "slot")?;
        let lease = self.manager.load_model(&slot).await?;
        Ok(json!({"slot": slot, "loaded": true, "memory_mb": lease.memory_mb}))
    }

    async fn handle_unload_model(&self, params: Value) -> Result<Value> {
        let slot = require_str(&params, "slot")?;
        self.manager.unload_model(&slot).await?;
        Ok(json!({"slot": slot, "unloaded": true}))
    }

    async fn handle_reload_config(&self, params: Value) -> Result<Value> {
        let config_path = opt_str(&params, "config_path");
        let new_config = fastsearch_core::load_config(config_path.as_deref().map(Path::new))?;
        let socket_path = new_config.daemon.socket_path.clone();
        self.manager.set_config(new_config.clone());
        *self.config.write().expect("config lock") = new_config;
        info!("configuration reloaded");
        Ok(json!({"reloaded": true, "socket_path": socket_path}))
    }

    async fn handle_shutdown(&self, _params: Value) -> Result<Value> {
        info!("shutdown requested over rpc");
        self.request_shutdown();
        Ok(json!({"shutdown": true}))
    }
}

fn encode_response(response: JsonRpcResponse) -> Vec<u8> {
    serde_json::to_vec(&response).unwrap_or_else(|_| {
        br#"{"jsonrpc":"2.0","error":{"code":-32000,"message":"response encoding failed"},"id":null}"#
            .to_vec()
    })
}

fn embed_single(embedder: &dyn EmbedderBackend, text: &str) -> Result<Vec<f32>> {
    embedder
        .embed(&[text.to_string()])?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("embedder returned no vector"))
}

fn elapsed_ms(started: Instant) -> f64 {
    (started.elapsed().as_secs_f64() * 1000.0 * 100.0).round() / 100.0
}

fn require_str(params: &Value, field: &str) -> Result<String> {
    params
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("missing '{field}' parameter"))
}

fn opt_str(params: &Value, field: &str) -> Option<String> {
    params
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn require_string_array(params: &Value, field: &str) -> Result<Vec<String>> {
    let items = params
        .get(field)
        .and_then(Value::as_array)
        .filter(|items| !items.is_empty())
        .ok_or_else(|| anyhow!("missing '{field}' parameter"))?;
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| anyhow!("'{field}' must be an array of strings"))
        })
        .collect()
}
