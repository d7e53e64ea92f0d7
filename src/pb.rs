//! Generated gRPC/protobuf types (build.rs compiles `proto/fabric.proto`
//! with protox + tonic-build). Re-exported under one module so the rest of
//! the crate never spells out the package path.

tonic::include_proto!("xdooria.fabric");
