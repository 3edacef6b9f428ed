mod client;

pub use client::{
    ApiErrorClass, ChunkReceipt, CreateRequest, CreatedFile, FileMeta, LoginStatus,
    PrecreateRequest, PrecreateResult, RemoteFile, TeraboxClient, TeraboxError,
};
