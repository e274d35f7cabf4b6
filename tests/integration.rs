use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc, oneshot};
use uuid::Uuid;

/// Spawn the memory MCP server binary with given args.
async fn spawn_server(args: &[&str]) -> Result<ServerHandle> {
    let mut cmd = Command::new(assert_cmd());
    cmd.args(args)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::inherit());

    let mut child = cmd.spawn()?;
    let stdout = child.stdout.take().unwrap();
    let mut stdin = child.stdin.take().unwrap();

    let (tx_out, mut rx_out) = mpsc::channel::<serde_json::Value>(32);
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

    // Writer task
    tokio::spawn(async move {
        while let Some(msg) = rx_out.recv().await {
            if let Ok(line) = serde_json::to_string(&msg) {
                let _ = stdin.write_all(line.as_bytes()).await;
                let _ = stdin.write_all(b"\n").await;
                let _ = stdin.flush().await;
            }
        }
    });

    // Reader task
    {
        let pending = pending.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                if let Ok(v) = serde_json::from_str::<serde_json::Value>(&line)
                    && let Some(id) = v.get("id").and_then(|x| x.as_str())
                    && let Some(waiter) = pending.lock().await.remove(id)
                {
                    let _ = waiter.send(v);
                }
                // Notifications without id are ignored
            }
        });
    }

    Ok(ServerHandle {
        child,
        tx_out,
        pending,
    })
}

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<serde_json::Value>>>>;

struct ServerHandle {
    child: Child,
    tx_out: mpsc::Sender<serde_json::Value>,
    pending: PendingMap,
}

impl ServerHandle {
    async fn request(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);
        self.tx_out
            .send(json!({"jsonrpc":"2.0","id":id,"method":method,"params":params}))
            .await?;
        let resp = rx.await?;
        Ok(resp)
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value> {
        self.request(
            "tools/call",
            json!({
                "name": name,
                "arguments": arguments
            }),
        )
        .await
    }

    async fn notify(&self, method: &str, params: serde_json::Value) -> Result<()> {
        self.tx_out
            .send(json!({"jsonrpc":"2.0","method":method,"params":params}))
            .await?;
        Ok(())
    }

    async fn kill(mut self) {
        let _ = self.child.kill().await;
    }
}

fn assert_cmd() -> PathBuf {
    // target/debug/memory-mcp-rs
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // deps
    path.pop(); // debug or release
    path.push("memory-mcp-rs");
    if cfg!(windows) {
        path.set_extension("exe");
    }
    path
}

async fn start_server(db: &Path) -> Result<ServerHandle> {
    let srv = spawn_server(&["--db", db.to_str().unwrap()]).await?;
    let _ = srv
        .request(
            "initialize",
            json!({
                "protocolVersion": "2025-06-18",
                "capabilities": {},
                "clientInfo": { "name": "test", "version": "1" }
            }),
        )
        .await?;
    srv.notify("notifications/initialized", json!({})).await?;
    Ok(srv)
}

fn assert_ok(res: &serde_json::Value) {
    assert!(!res["result"]["is_error"].as_bool().unwrap_or(false));
}

fn assert_err(res: &serde_json::Value) {
    if let Some(err) = res.get("error") {
        assert!(err.is_object());
        return;
    }
    assert!(res["result"]["is_error"].as_bool().unwrap_or(false));
}

fn entity_names(graph: &serde_json::Value) -> Vec<&str> {
    graph["entities"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|e| e.get("name").and_then(|v| v.as_str()))
        .collect()
}

#[tokio::test]
async fn tools_list_includes_all_tools() -> Result<()> {
    let tmp = TempDir::new()?;
    let srv = start_server(&tmp.path().join("memory.db")).await?;

    let tools = srv.request("tools/list", json!({})).await?;
    let names: Vec<_> = tools["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|t| t.get("name").and_then(|v| v.as_str()))
        .collect();
    for required in [
        "create_entities",
        "create_relations",
        "add_observations",
        "delete_entities",
        "delete_observations",
        "delete_relations",
        "read_graph",
        "search_nodes",
        "open_nodes",
    ] {
        assert!(names.contains(&required));
    }

    srv.kill().await;
    Ok(())
}

#[tokio::test]
async fn create_entities_and_relations_then_read_graph() -> Result<()> {
    let tmp = TempDir::new()?;
    let srv = start_server(&tmp.path().join("memory.db")).await?;

    let res = srv
        .call_tool(
            "create_entities",
            json!({ "entities": [
                { "name": "Bob", "entityType": "person" },
                { "name": "Alice", "entityType": "person", "observations": ["likes tea"] }
            ]}),
        )
        .await?;
    assert_ok(&res);
    assert_eq!(
        res["result"]["structuredContent"]["entities"]
            .as_array()
            .unwrap()
            .len(),
        2
    );

    let rel = srv
        .call_tool(
            "create_relations",
            json!({ "relations": [
                { "from": "Alice", "to": "Bob", "relationType": "knows" }
            ]}),
        )
        .await?;
    assert_ok(&rel);

    let graph = srv.call_tool("read_graph", json!({})).await?;
    let content = &graph["result"]["structuredContent"];
    // Entities come back sorted by name regardless of insertion order.
    assert_eq!(entity_names(content), vec!["Alice", "Bob"]);
    assert_eq!(
        content["entities"][0]["observations"],
        json!(["likes tea"])
    );
    assert_eq!(
        content["relations"],
        json!([{ "from": "Alice", "to": "Bob", "relationType": "knows" }])
    );

    srv.kill().await;
    Ok(())
}

#[tokio::test]
async fn create_entities_skips_existing_names() -> Result<()> {
    let tmp = TempDir::new()?;
    let srv = start_server(&tmp.path().join("memory.db")).await?;

    let first = srv
        .call_tool(
            "create_entities",
            json!({ "entities": [{ "name": "Alice", "entityType": "person" }]}),
        )
        .await?;
    assert_ok(&first);

    // Resubmitting the same name creates nothing and changes nothing.
    let second = srv
        .call_tool(
            "create_entities",
            json!({ "entities": [
                { "name": "Alice", "entityType": "robot", "observations": ["ignored"] }
            ]}),
        )
        .await?;
    assert_ok(&second);
    assert!(second["result"]["structuredContent"]["entities"]
        .as_array()
        .unwrap()
        .is_empty());

    let graph = srv.call_tool("read_graph", json!({})).await?;
    let content = &graph["result"]["structuredContent"];
    assert_eq!(content["entities"][0]["entityType"], "person");
    assert_eq!(content["entities"][0]["observations"], json!([]));

    srv.kill().await;
    Ok(())
}

#[tokio::test]
async fn add_observations_deduplicates_and_rejects_unknown_entity() -> Result<()> {
    let tmp = TempDir::new()?;
    let srv = start_server(&tmp.path().join("memory.db")).await?;

    srv.call_tool(
        "create_entities",
        json!({ "entities": [
            { "name": "Alice", "entityType": "person", "observations": ["likes tea"] }
        ]}),
    )
    .await?;

    let res = srv
        .call_tool(
            "add_observations",
            json!({ "observations": [
                { "entityName": "Alice", "contents": ["likes tea", "drinks coffee"] }
            ]}),
        )
        .await?;
    assert_ok(&res);
    assert_eq!(
        res["result"]["structuredContent"]["results"][0]["addedObservations"],
        json!(["drinks coffee"])
    );

    // Unknown entity fails the whole call and applies nothing.
    let err = srv
        .call_tool(
            "add_observations",
            json!({ "observations": [
                { "entityName": "Alice", "contents": ["third"] },
                { "entityName": "Ghost", "contents": ["lost"] }
            ]}),
        )
        .await?;
    assert_err(&err);

    let graph = srv.call_tool("read_graph", json!({})).await?;
    assert_eq!(
        graph["result"]["structuredContent"]["entities"][0]["observations"],
        json!(["likes tea", "drinks coffee"])
    );

    srv.kill().await;
    Ok(())
}

#[tokio::test]
async fn create_relations_skips_missing_endpoints_and_duplicates() -> Result<()> {
    let tmp = TempDir::new()?;
    let srv = start_server(&tmp.path().join("memory.db")).await?;

    srv.call_tool(
        "create_entities",
        json!({ "entities": [
            { "name": "Alice", "entityType": "person" },
            { "name": "Bob", "entityType": "person" }
        ]}),
    )
    .await?;

    let res = srv
        .call_tool(
            "create_relations",
            json!({ "relations": [
                { "from": "Alice", "to": "Bob", "relationType": "knows" },
                { "from": "Alice", "to": "Bob", "relationType": "knows" },
                { "from": "Alice", "to": "Ghost", "relationType": "knows" }
            ]}),
        )
        .await?;
    assert_ok(&res);
    assert_eq!(
        res["result"]["structuredContent"]["relations"]
            .as_array()
            .unwrap()
            .len(),
        1
    );

    srv.kill().await;
    Ok(())
}

#[tokio::test]
async fn delete_entities_cascades_relations_and_observations() -> Result<()> {
    let tmp = TempDir::new()?;
    let srv = start_server(&tmp.path().join("memory.db")).await?;

    srv.call_tool(
        "create_entities",
        json!({ "entities": [
            { "name": "Alice", "entityType": "person", "observations": ["obs"] },
            { "name": "Bob", "entityType": "person" }
        ]}),
    )
    .await?;
    srv.call_tool(
        "create_relations",
        json!({ "relations": [
            { "from": "Alice", "to": "Bob", "relationType": "knows" },
            { "from": "Bob", "to": "Alice", "relationType": "follows" }
        ]}),
    )
    .await?;

    let res = srv
        .call_tool("delete_entities", json!({ "entityNames": ["Alice", "Ghost"] }))
        .await?;
    assert_ok(&res);

    let graph = srv.call_tool("read_graph", json!({})).await?;
    let content = &graph["result"]["structuredContent"];
    assert_eq!(entity_names(content), vec!["Bob"]);
    assert!(content["relations"].as_array().unwrap().is_empty());

    srv.kill().await;
    Ok(())
}

#[tokio::test]
async fn delete_observations_and_relations_ignore_missing_targets() -> Result<()> {
    let tmp = TempDir::new()?;
    let srv = start_server(&tmp.path().join("memory.db")).await?;

    srv.call_tool(
        "create_entities",
        json!({ "entities": [
            { "name": "Alice", "entityType": "person", "observations": ["keep", "drop"] },
            { "name": "Bob", "entityType": "person" }
        ]}),
    )
    .await?;
    srv.call_tool(
        "create_relations",
        json!({ "relations": [{ "from": "Alice", "to": "Bob", "relationType": "knows" }]}),
    )
    .await?;

    let obs = srv
        .call_tool(
            "delete_observations",
            json!({ "deletions": [
                { "entityName": "Alice", "observations": ["drop", "never there"] },
                { "entityName": "Ghost", "observations": ["anything"] }
            ]}),
        )
        .await?;
    assert_ok(&obs);

    let rel = srv
        .call_tool(
            "delete_relations",
            json!({ "relations": [
                { "from": "Alice", "to": "Bob", "relationType": "unrelated" },
                { "from": "Ghost", "to": "Bob", "relationType": "knows" }
            ]}),
        )
        .await?;
    assert_ok(&rel);

    let graph = srv.call_tool("read_graph", json!({})).await?;
    let content = &graph["result"]["structuredContent"];
    assert_eq!(content["entities"][0]["observations"], json!(["keep"]));
    assert_eq!(content["relations"].as_array().unwrap().len(), 1);

    srv.kill().await;
    Ok(())
}

#[tokio::test]
async fn search_nodes_returns_induced_subgraph() -> Result<()> {
    let tmp = TempDir::new()?;
    let srv = start_server(&tmp.path().join("memory.db")).await?;

    srv.call_tool(
        "create_entities",
        json!({ "entities": [
            { "name": "Alpha", "entityType": "greek" },
            { "name": "Beta", "entityType": "greek" },
            { "name": "Omega", "entityType": "other" }
        ]}),
    )
    .await?;
    srv.call_tool(
        "create_relations",
        json!({ "relations": [
            { "from": "Alpha", "to": "Beta", "relationType": "precedes" },
            { "from": "Alpha", "to": "Omega", "relationType": "precedes" }
        ]}),
    )
    .await?;

    let res = srv
        .call_tool("search_nodes", json!({ "query": "GREEK" }))
        .await?;
    assert_ok(&res);
    let content = &res["result"]["structuredContent"];
    assert_eq!(entity_names(content), vec!["Alpha", "Beta"]);
    // Alpha -> Omega must not leak in: Omega did not match.
    assert_eq!(
        content["relations"],
        json!([{ "from": "Alpha", "to": "Beta", "relationType": "precedes" }])
    );

    // Blank query matches nothing.
    let empty = srv.call_tool("search_nodes", json!({ "query": "  " })).await?;
    assert!(empty["result"]["structuredContent"]["entities"]
        .as_array()
        .unwrap()
        .is_empty());

    srv.kill().await;
    Ok(())
}

#[tokio::test]
async fn open_nodes_drops_unknown_names() -> Result<()> {
    let tmp = TempDir::new()?;
    let srv = start_server(&tmp.path().join("memory.db")).await?;

    srv.call_tool(
        "create_entities",
        json!({ "entities": [
            { "name": "Alice", "entityType": "person" },
            { "name": "Bob", "entityType": "person" }
        ]}),
    )
    .await?;
    srv.call_tool(
        "create_relations",
        json!({ "relations": [{ "from": "Alice", "to": "Bob", "relationType": "knows" }]}),
    )
    .await?;

    let res = srv
        .call_tool("open_nodes", json!({ "names": ["Bob", "Ghost", "Alice"] }))
        .await?;
    assert_ok(&res);
    let content = &res["result"]["structuredContent"];
    assert_eq!(entity_names(content), vec!["Alice", "Bob"]);
    assert_eq!(content["relations"].as_array().unwrap().len(), 1);

    let empty = srv.call_tool("open_nodes", json!({ "names": [] })).await?;
    assert!(empty["result"]["structuredContent"]["entities"]
        .as_array()
        .unwrap()
        .is_empty());

    srv.kill().await;
    Ok(())
}

#[tokio::test]
async fn graph_persists_across_server_restarts() -> Result<()> {
    let tmp = TempDir::new()?;
    let db = tmp.path().join("memory.db");

    let srv = start_server(&db).await?;
    srv.call_tool(
        "create_entities",
        json!({ "entities": [
            { "name": "Alice", "entityType": "person", "observations": ["likes tea"] }
        ]}),
    )
    .await?;
    srv.kill().await;

    let srv = start_server(&db).await?;
    let graph = srv.call_tool("read_graph", json!({})).await?;
    let content = &graph["result"]["structuredContent"];
    assert_eq!(entity_names(content), vec!["Alice"]);
    assert_eq!(content["entities"][0]["observations"], json!(["likes tea"]));

    srv.kill().await;
    Ok(())
}

#[tokio::test]
async fn invalid_entity_name_is_rejected() -> Result<()> {
    let tmp = TempDir::new()?;
    let srv = start_server(&tmp.path().join("memory.db")).await?;

    let res = srv
        .call_tool(
            "create_entities",
            json!({ "entities": [{ "name": "", "entityType": "person" }]}),
        )
        .await?;
    assert_err(&res);

    srv.kill().await;
    Ok(())
}
