use mobilenetv1_burn::{Backbone, BackboneRegistry};

use burn::{
    backend::NdArray,
    module::Module,
    tensor::{Distribution, Tensor},
};
use serde_json::json;

const HEIGHT: usize = 300;
const WIDTH: usize = 300;

pub fn main() {
    pretty_env_logger::init();

    // Optional backbone spec, e.g. {"name": "MobileNet", "config": {"extra_blocks": true}}
    let spec_path = std::env::args().nth(1);

    let device = Default::default();
    let registry = BackboneRegistry::<NdArray>::default();
    let backbone = match &spec_path {
        Some(path) => registry.build_file(path, &device),
        None => registry.build_json(
            &json!({ "name": "MobileNet", "config": { "extra_blocks": true } }).to_string(),
            &device,
        ),
    }
    .map_err(|err| format!("Failed to build backbone.\nError: {err}"))
    .unwrap();

    let Backbone::MobileNet(model) = &backbone;

    // Forward pass on a random image batch [B, C, H, W]
    let x = Tensor::<NdArray, 4>::random([1, 3, HEIGHT, WIDTH], Distribution::Default, &device);
    let features = backbone.forward(x);

    println!("Input: [1, 3, {HEIGHT}, {WIDTH}]");
    for (idx, feature) in features.iter().enumerate() {
        println!("Feature {idx}: {:?}", feature.dims());
    }

    println!("\nParameters ({} values):", model.num_params());
    for (name, _) in model.param_ids() {
        println!("  {name}");
    }
}
