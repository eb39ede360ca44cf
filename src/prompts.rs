//! Prompt text for narration generation.
//!
//! All prompt wording lives here so it can be reviewed and tested without a
//! model behind it. [`crate::pipeline::narrate`] only decides *when* to call
//! the model; this module decides *what* it is asked.

/// Transcript used when the run has no source video.
pub const NO_VIDEO_TRANSCRIPT: &str =
    "No video for this file. Please use the passage only to generate.";

/// Upper bound, in seconds, the model is asked to respect per narration.
pub const NARRATION_SECONDS: u32 = 15;

/// Build the narration prompt for one slide.
///
/// `slide_number` is 1-indexed. The full transcript is embedded on every call
/// because each request is independent; the model has no memory of earlier
/// slides.
pub fn narration_prompt(transcript: &str, slide_number: usize, slide_text: &str) -> String {
    format!(
        "Here is the full transcript of the talk:\n\
{transcript}\n\
\n\
Here is the content of slide {slide_number}; the previous slides have already been narrated:\n\
{slide_text}\n\
\n\
Using the material above, extract the points that relate directly to this slide and write \
a narration for it that can be spoken in at most {NARRATION_SECONDS} seconds.\n\
\n\
Requirements:\n\
1. You are the presenter. Speak naturally, the way a person talks.\n\
2. Start with the content immediately. No greeting, no opening remarks, no filler such as \
\"Okay\" or \"Let's look at slide {slide_number}\".\n\
3. Plain spoken text only: no markdown, no bullet points, no headings."
    )
}
