mod api;

pub use api::{
    DecryptResponse, EncryptRequest, HealthResponse, KeysResponse, ReadinessResponse,
    RefreshRequest, RevokeRequest, RevokeResponse, RotateResponse, WhoAmIResponse,
};
