pub mod cni {
    pub mod v1 {
        tonic::include_proto!("grpc.cni.v1");
    }
}
