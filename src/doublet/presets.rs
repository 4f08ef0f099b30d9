use std::collections::HashMap;

use itertools::Itertools;

pub const DEFAULT_PRESET: &str = "scrublet";


fn get_preset_scripts() -> HashMap<String, &'static [u8]> {
    let mut map: HashMap<String, &'static [u8]> = HashMap::new();
    map.insert("scrublet".to_string(), include_bytes!("scrublet.py"));
    map
}


pub fn get_preset_script(preset_name: impl Into<String>) -> Option<&'static [u8]> {
    get_preset_scripts().get(&preset_name.into()).copied()
}


pub fn get_preset_script_names() -> Vec<String> {
    get_preset_scripts().keys().sorted().cloned().collect()
}
