mod gateway;

pub use gateway::{McpGateway, RemoteServer, RemoteTool, ServerAuth};
