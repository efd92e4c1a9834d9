pub mod control {
    tonic::include_proto!("control");
}

pub mod shard {
    tonic::include_proto!("shard");
}
