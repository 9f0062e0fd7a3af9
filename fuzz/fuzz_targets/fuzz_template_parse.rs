#![no_main]

use libfuzzer_sys::fuzz_target;
use sm_template::Template;

// Any template that parses must print back to a string that parses to the
// same segments.
fuzz_target!(|data: &[u8]| {
    let Ok(source) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(template) = Template::parse(source) {
        let printed = template.to_template_string();
        let reparsed = Template::parse(&printed).expect("printed template parses");
        assert_eq!(reparsed, template);
    }
});
