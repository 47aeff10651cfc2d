// Generated protobuf/gRPC bindings, included from the build-script output.

pub mod controller {
    pub mod v1 {
        tonic::include_proto!("segment.controller.v1");
    }
}

pub mod containerd {
    pub mod events {
        pub mod v1 {
            tonic::include_proto!("segment.containerd.events.v1");
        }
    }
}
