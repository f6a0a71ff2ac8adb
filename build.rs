fn main() {
    std::env::set_var(
        "PROTOC",
        protoc_bin_vendored::protoc_bin_path().expect("failed to locate vendored protoc"),
    );
    prost_build::compile_protos(
        &["src/proto/osmformat.proto", "src/proto/fileformat.proto"],
        &["src/proto"],
    )
    .expect("failed to compile protobuf");
}
