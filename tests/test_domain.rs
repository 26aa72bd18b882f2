// Copyright (C) 2025 Matías Salinas (support@fenden.com)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#[cfg(test)]
mod tests {
    use poolgate::domain::sanitize_authorization;

    #[test]
    fn p10_truncates_long_values_to_ten_chars_plus_ellipsis() {
        let sanitized = sanitize_authorization("Bearer sk-abcdefghijklmnop");
        assert_eq!(sanitized, "Bearer sk-…");
        assert_eq!(sanitized.chars().count(), 11);
    }

    #[test]
    fn p10_short_values_pass_through_before_the_ellipsis() {
        assert_eq!(sanitize_authorization("short"), "short…");
        assert_eq!(sanitize_authorization(""), "…");
    }
}
