use std::path::PathBuf;

use clap::Parser;
use rmcp::{
    ErrorData as McpError, ServerHandler, ServiceExt,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo},
    serde::{Deserialize, Serialize},
    tool, tool_handler, tool_router,
    transport::stdio,
};
use schemars::JsonSchema;
use serde_json::json;

use crate::error::StoreError;
use crate::graph::{Entity, ObservationDeletion, ObservationInput, Relation};
use crate::storage::Database;

mod error;
mod graph;
mod logging;
mod storage;

use logging::{TransportMode, init_logging};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the SQLite database file
    #[arg(long, value_name = "FILE", default_value = "memory.db")]
    db: PathBuf,

    /// Enable streamable HTTP mode (default: stdio)
    #[arg(short = 's', long = "stream")]
    stream_mode: bool,

    /// HTTP port for stream mode
    #[arg(short = 'p', long, default_value = "8000")]
    port: u16,

    /// Bind address for stream mode
    #[arg(short = 'b', long, default_value = "127.0.0.1")]
    bind: String,

    /// Enable file logging. Optionally specify log file name (default: memory-mcp-rs.log)
    #[arg(short = 'l', long, value_name = "FILE", num_args = 0..=1, default_missing_value = "memory-mcp-rs.log")]
    log: Option<String>,
}

#[derive(Clone)]
struct MemoryServer {
    memory: Database,
    tool_router: ToolRouter<Self>,
}

impl MemoryServer {
    fn new(memory: Database) -> Self {
        Self {
            memory,
            tool_router: Self::tool_router(),
        }
    }

    fn server_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: Default::default(),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "memory-mcp-rs".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: None,
                website_url: None,
                icons: None,
            },
            instructions: Some(
                "Persistent knowledge graph memory. Entities are identified by name; \
                 use create_entities / create_relations / add_observations to record \
                 facts and search_nodes / open_nodes / read_graph to recall them."
                    .to_string(),
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct CreateEntitiesArgs {
    entities: Vec<Entity>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct CreateRelationsArgs {
    relations: Vec<Relation>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct AddObservationsArgs {
    observations: Vec<ObservationInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
struct DeleteEntitiesArgs {
    entity_names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct DeleteObservationsArgs {
    deletions: Vec<ObservationDeletion>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct DeleteRelationsArgs {
    relations: Vec<Relation>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct SearchNodesArgs {
    /// Text to match against entity names, types, and observation content
    query: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct OpenNodesArgs {
    names: Vec<String>,
}

#[tool_router]
impl MemoryServer {
    #[tool(
        name = "create_entities",
        description = "Create multiple new entities in the knowledge graph. Entities whose name already exists are skipped, never updated. Returns the entities actually created."
    )]
    async fn create_entities(
        &self,
        Parameters(CreateEntitiesArgs { entities }): Parameters<CreateEntitiesArgs>,
    ) -> Result<CallToolResult, McpError> {
        let created = self.memory.create_entities(&entities).map_err(store_err)?;
        json_response(json!({ "entities": created }))
    }

    #[tool(
        name = "create_relations",
        description = "Create multiple new directed relations between existing entities. Relations with a missing endpoint or an already-stored triple are skipped. Returns the relations actually created."
    )]
    async fn create_relations(
        &self,
        Parameters(CreateRelationsArgs { relations }): Parameters<CreateRelationsArgs>,
    ) -> Result<CallToolResult, McpError> {
        let created = self.memory.create_relations(&relations).map_err(store_err)?;
        json_response(json!({ "relations": created }))
    }

    #[tool(
        name = "add_observations",
        description = "Add observations to existing entities. Fails (and applies nothing) if any named entity does not exist. Returns per entity the observations actually added."
    )]
    async fn add_observations(
        &self,
        Parameters(AddObservationsArgs { observations }): Parameters<AddObservationsArgs>,
    ) -> Result<CallToolResult, McpError> {
        let results = self
            .memory
            .add_observations(&observations)
            .map_err(store_err)?;
        json_response(json!({ "results": results }))
    }

    #[tool(
        name = "delete_entities",
        description = "Delete entities by name, together with their observations and every relation they participate in. Unknown names are ignored."
    )]
    async fn delete_entities(
        &self,
        Parameters(DeleteEntitiesArgs { entity_names }): Parameters<DeleteEntitiesArgs>,
    ) -> Result<CallToolResult, McpError> {
        self.memory.delete_entities(&entity_names).map_err(store_err)?;
        Ok(CallToolResult::success(vec![Content::text(
            "Entities deleted successfully",
        )]))
    }

    #[tool(
        name = "delete_observations",
        description = "Delete specific observation strings from entities. Unknown entities and non-matching observations are ignored."
    )]
    async fn delete_observations(
        &self,
        Parameters(DeleteObservationsArgs { deletions }): Parameters<DeleteObservationsArgs>,
    ) -> Result<CallToolResult, McpError> {
        self.memory.delete_observations(&deletions).map_err(store_err)?;
        Ok(CallToolResult::success(vec![Content::text(
            "Observations deleted successfully",
        )]))
    }

    #[tool(
        name = "delete_relations",
        description = "Delete specific relation triples from the graph. Triples that do not exist are ignored."
    )]
    async fn delete_relations(
        &self,
        Parameters(DeleteRelationsArgs { relations }): Parameters<DeleteRelationsArgs>,
    ) -> Result<CallToolResult, McpError> {
        self.memory.delete_relations(&relations).map_err(store_err)?;
        Ok(CallToolResult::success(vec![Content::text(
            "Relations deleted successfully",
        )]))
    }

    #[tool(
        name = "read_graph",
        description = "Read the entire knowledge graph: all entities with their observations, and all relations."
    )]
    async fn read_graph(&self) -> Result<CallToolResult, McpError> {
        let graph = self.memory.read_graph().map_err(store_err)?;
        let value =
            serde_json::to_value(graph).map_err(internal_err("Failed to serialize graph"))?;
        json_response(value)
    }

    #[tool(
        name = "search_nodes",
        description = "Search for entities whose name, type, or observations match the query (case-insensitive substring or full-text match), plus the relations between the matched entities. An empty query matches nothing."
    )]
    async fn search_nodes(
        &self,
        Parameters(SearchNodesArgs { query }): Parameters<SearchNodesArgs>,
    ) -> Result<CallToolResult, McpError> {
        let graph = self.memory.search_nodes(&query).map_err(store_err)?;
        let value =
            serde_json::to_value(graph).map_err(internal_err("Failed to serialize graph"))?;
        json_response(value)
    }

    #[tool(
        name = "open_nodes",
        description = "Retrieve specific entities by name, plus the relations between them. Unknown names are silently dropped."
    )]
    async fn open_nodes(
        &self,
        Parameters(OpenNodesArgs { names }): Parameters<OpenNodesArgs>,
    ) -> Result<CallToolResult, McpError> {
        let graph = self.memory.open_nodes(&names).map_err(store_err)?;
        let value =
            serde_json::to_value(graph).map_err(internal_err("Failed to serialize graph"))?;
        json_response(value)
    }
}

#[tool_handler]
impl ServerHandler for MemoryServer {
    fn get_info(&self) -> ServerInfo {
        self.server_info()
    }
}

/// Run server in stdio mode (default)
async fn run_stdio_mode(server: MemoryServer) -> Result<(), Box<dyn std::error::Error>> {
    let transport = stdio();
    let svc = server.serve(transport).await?;
    svc.waiting().await?;
    Ok(())
}

/// Run server in streamable HTTP mode
async fn run_stream_mode(
    server: MemoryServer,
    bind: &str,
    port: u16,
) -> Result<(), Box<dyn std::error::Error>> {
    use rmcp::transport::StreamableHttpService;
    use rmcp::transport::streamable_http_server::session::local::LocalSessionManager;

    let addr = format!("{}:{}", bind, port);
    tracing::info!("Starting MCP HTTP server on http://{}/mcp", addr);

    let service = StreamableHttpService::new(
        move || Ok(server.clone()),
        LocalSessionManager::default().into(),
        Default::default(),
    );

    let router = axum::Router::new()
        .nest_service("/mcp", service)
        .route("/health", axum::routing::get(|| async { "OK" }));

    let tcp_listener = tokio::net::TcpListener::bind(&addr).await?;

    axum::serve(tcp_listener, router)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mode = if args.stream_mode {
        TransportMode::Stream
    } else {
        TransportMode::Stdio
    };

    // CRITICAL: stdio mode MUST NOT log to stderr by default!
    // Any stderr output during handshake causes "connection closed" in MCP clients
    init_logging(mode, args.log)?;

    let memory = Database::open(&args.db)?;
    let server = MemoryServer::new(memory);

    match mode {
        TransportMode::Stdio => run_stdio_mode(server).await,
        TransportMode::Stream => run_stream_mode(server, &args.bind, args.port).await,
    }
}

fn store_err(err: StoreError) -> McpError {
    match err {
        StoreError::EntityNotFound(_) | StoreError::InvalidInput(_) => {
            McpError::invalid_params(err.to_string(), None)
        }
        other => McpError::internal_error(other.to_string(), None),
    }
}

fn internal_err<T: ToString>(message: &'static str) -> impl FnOnce(T) -> McpError + Clone {
    move |err| McpError::internal_error(message, Some(json!({ "error": err.to_string() })))
}

/// Pretty JSON as the text content, the raw value as structured content.
fn json_response(value: serde_json::Value) -> Result<CallToolResult, McpError> {
    let text =
        serde_json::to_string_pretty(&value).map_err(internal_err("Failed to serialize result"))?;
    Ok(CallToolResult::success(vec![Content::text(text)]).with_structured(value))
}

trait WithStructured {
    fn with_structured(self, value: serde_json::Value) -> Self;
}

impl WithStructured for CallToolResult {
    fn with_structured(mut self, value: serde_json::Value) -> Self {
        self.structured_content = Some(value);
        self
    }
}
